/// Packet stream construction.
///
/// Provides the [`PacketBuilder`](build::PacketBuilder) for laying frames out
/// across packets.
pub mod build;

/// Frame extraction from packet streams.
///
/// Provides the [`Extractor`](extract::Extractor), yielding
/// [`Frame`](extract::Frame) objects ready for a codec.
pub mod extract;

/// Decode state of one playback context.
pub mod playback;

/// Playback sessions driven by a worker thread.
///
/// Provides the [`PlaybackSession`](session::PlaybackSession).
pub mod session;

pub(crate) mod worker;
