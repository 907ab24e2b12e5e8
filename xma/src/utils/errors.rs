#[macro_export]
macro_rules! log_or_err {
    ($state:expr, $level:expr, $err:expr $(,)?) => {{
        if $level <= $state.fail_level {
            return Err($err);
        } else {
            match $level {
                ::log::Level::Error => ::log::error!("{}", $err),
                ::log::Level::Warn => ::log::warn!("{}", $err),
                ::log::Level::Info => ::log::info!("{}", $err),
                ::log::Level::Debug => ::log::debug!("{}", $err),
                ::log::Level::Trace => ::log::trace!("{}", $err),
            }
        }
    }};
}

#[derive(thiserror::Error, Debug)]
pub enum PacketError {
    #[error("Packet must be {expected} bytes, got {actual}")]
    InvalidPacketSize { expected: usize, actual: usize },

    #[error("First frame offset {offset} lies beyond the packet ({bits} bits)")]
    FrameOffsetBeyondPacket { offset: u32, bits: u32 },

    #[error("Zero-length frame at bit {0}: the continuation bit cannot be located")]
    ZeroLengthFrame(u64),

    #[error("Frame size of {0} bits is outside 16..=16352")]
    InvalidFrameSize(u32),
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("Read offset {offset} is outside the input buffer ({size} bytes)")]
    ReadOffsetOutOfRange { offset: u32, size: u32 },

    #[error("Split frame at bit {offset} has no continuation packet available")]
    SplitFrameUnavailable { offset: u32 },

    #[error("Input slot is marked valid but has no buffer handle")]
    MissingInputBuffer,

    #[error("Frame of {0} bits does not fit the frame buffer")]
    FrameTooLarge(u32),
}

impl DecodeError {
    /// Error bits reported to the caller through the error query.
    pub fn error_bits(&self) -> u32 {
        match self {
            DecodeError::ReadOffsetOutOfRange { .. } => 1,
            DecodeError::MissingInputBuffer => 2,
            DecodeError::SplitFrameUnavailable { .. } => 4,
            DecodeError::FrameTooLarge(_) => 8,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("The modify lock is not held")]
    NotLocked,

    #[error("Both input buffers are already queued")]
    BufferFull,

    #[error("Input buffer of {0} bytes holds no complete packet")]
    EmptyBuffer(u32),

    #[error("Buffer handle is null")]
    NullBuffer,

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl PlaybackError {
    /// Status word the console API reports for this error.
    pub fn status(&self) -> u32 {
        match self {
            PlaybackError::NotLocked => 1,
            PlaybackError::BufferFull => 0x8007_0005,
            PlaybackError::EmptyBuffer(_) | PlaybackError::NullBuffer => 0x8007_0057,
            PlaybackError::Memory(MemoryError::OutOfMemory { .. }) => 0x8007_000E,
            PlaybackError::Memory(MemoryError::Unmapped { .. }) => 0x8007_0057,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CreateError {
    #[error("Channel count must be 1 or 2, got {0}")]
    UnsupportedChannelCount(u32),

    #[error("Subframes per decode step must be nonzero")]
    InvalidSubframes,

    #[error("Output buffer size {size} yields no output blocks for {channels} channel(s)")]
    EmptyOutputBuffer { size: u32, channels: u32 },

    #[error("Output ring of {blocks} blocks cannot hold one decode step of {required} blocks")]
    OutputTooSmall { blocks: u32, required: u32 },

    #[error("Failed to allocate output buffer: {0}")]
    Allocation(#[from] MemoryError),

    #[error("Failed to open codec: {0}")]
    Codec(#[from] CodecError),

    #[error("Failed to spawn decode worker: {0}")]
    Worker(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Out of guest memory: {requested} bytes requested, {available} available")]
    OutOfMemory { requested: u32, available: u32 },

    #[error("Guest address {address:#010X}+{len} is not mapped")]
    Unmapped { address: u32, len: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("Codec does not support {sample_rate} Hz with {channels} channel(s)")]
    Unsupported { sample_rate: u32, channels: u32 },

    #[error("Codec rejected frame: {0}")]
    InvalidFrame(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    #[error("Insufficient buffer data for frame extraction")]
    InsufficientData,

    #[error("No frame starts at bit {offset} of packet {index}")]
    NoFrameAtOffset { index: usize, offset: u32 },

    #[error("Malformed packet {index}: {source}")]
    MalformedPacket { index: usize, source: PacketError },

    #[error("Frame in packet {index} could not be assembled: {source}")]
    Assembly { index: usize, source: DecodeError },
}
