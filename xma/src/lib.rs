//! Packet parser and playback engine for XMA audio streams.
//!
//! ## Technical Overview
//!
//! ### Bitstream Organization
//!
//! **Packets**: fixed 2048-byte blocks with a 32-bit header.
//! **Frames**: variable-length bit runs inside packet payloads, each opened by
//! a 15-bit length and closed by a continuation bit. A frame may run on into
//! the next packet of the stream.
//!
//! ### Playback
//!
//! A session owns two input buffer slots and one output ring of 256-byte
//! sub-blocks. A worker thread decodes frames from the current input buffer
//! into the ring as 16-bit big-endian interleaved PCM while the caller
//! submits more input and drains output under a modify lock.
//!
//! ## Quick Start
//!
//! ```rust
//! use xma::process::build::PacketBuilder;
//! use xma::process::extract::Extractor;
//!
//! let mut builder = PacketBuilder::new();
//! builder.push_frame(6_000, &[0xC3; 16])?;
//! builder.push_frame(6_000, &[0x3C; 16])?;
//!
//! let mut extractor = Extractor::default();
//! extractor.push_bytes(&builder.build());
//!
//! for result in extractor {
//!     match result {
//!         Ok(frame) => println!("{} bits at packet {}", frame.size_bits, frame.packet_index),
//!         Err(e) => eprintln!("{e}"),
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Frame decoder interface.
pub mod codec;

/// Session parameters and output ring geometry.
pub mod config;

/// Guest address space the engine reads input from and writes PCM to.
pub mod memory;

/// Stream processing.
///
/// 1. **Building** ([`process::build`]): packs frames into packets.
/// 2. **Extraction** ([`process::extract`]): walks a packet stream frame by frame.
/// 3. **Playback** ([`process::session`]): double-buffered decode into an output ring.
pub mod process;

/// Packet and frame layout.
pub mod structs;

/// Bit reading, ring buffers and error types.
pub mod utils;
