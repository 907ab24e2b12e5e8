//! Packet layout and frame location.
//!
//! ## Packet
//!
//! A packet is a fixed 2048-byte block. Its 32-bit header is, MSB first:
//!
//! | bits | field |
//! |------|-------|
//! | 6    | number of frames starting in the packet (informational) |
//! | 15   | bit offset of the first frame start, relative to the end of the header |
//! | 3    | metadata |
//! | 8    | packets to skip before the next packet of this stream |
//!
//! ## Frame
//!
//! Frames follow each other without alignment. Each frame begins with a 15-bit
//! length (in bits, covering the whole frame) and ends with one continuation
//! bit; a cleared continuation bit ends the run of frames in the packet. The
//! length `0x7FFF` marks the end of the frame data. The last frame of a packet
//! may continue into the payload of the next packet.

use std::io;

use log::warn;

use crate::utils::bit_cursor::BitCursor;
use crate::utils::errors::PacketError;

pub const BYTES_PER_PACKET: usize = 2048;
pub const BYTES_PER_PACKET_HEADER: usize = 4;
pub const BYTES_PER_PACKET_DATA: usize = BYTES_PER_PACKET - BYTES_PER_PACKET_HEADER;

pub const BITS_PER_PACKET: u32 = (BYTES_PER_PACKET as u32) << 3;
pub const BITS_PER_PACKET_HEADER: u32 = (BYTES_PER_PACKET_HEADER as u32) << 3;
pub const BITS_PER_PACKET_DATA: u32 = BITS_PER_PACKET - BITS_PER_PACKET_HEADER;

pub const BITS_PER_FRAME_HEADER: u32 = 15;

/// Frame length that terminates the frame data of a packet.
pub const FRAME_LENGTH_SENTINEL: u32 = 0x7FFF;

/// Largest first-frame offset that still denotes a frame start in the packet.
pub const MAX_FRAME_SIZE_IN_BITS: u32 = 0x4000 - BITS_PER_PACKET_HEADER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub frame_count: u8,
    /// Absolute bit offset of the first frame start, header included.
    pub first_frame_offset: u32,
    pub metadata: u8,
    pub skip_count: u8,
}

impl PacketHeader {
    pub fn read(packet: &[u8]) -> io::Result<Self> {
        let mut reader = BitCursor::new(packet, BITS_PER_PACKET_HEADER as u64);

        Ok(Self {
            frame_count: reader.read(6)? as u8,
            first_frame_offset: reader.read(15)? as u32 + BITS_PER_PACKET_HEADER,
            metadata: reader.read(3)? as u8,
            skip_count: reader.read(8)? as u8,
        })
    }

    /// Distance, in packets, to the packet that continues this stream.
    pub fn packets_to_skip(&self) -> u32 {
        self.skip_count as u32 + 1
    }

    /// Whether any frame starts inside this packet.
    pub fn has_frame_start(&self) -> bool {
        self.first_frame_offset <= MAX_FRAME_SIZE_IN_BITS
    }
}

/// Packet index holding `bit_offset` in a buffer of `size` bytes.
///
/// Offsets inside the first header or past the buffer have no packet.
pub fn packet_number(size: u32, bit_offset: u32) -> Option<u32> {
    if bit_offset < BITS_PER_PACKET_HEADER {
        return None;
    }

    if bit_offset as u64 >= (size as u64) << 3 {
        return None;
    }

    Some((bit_offset >> 3) / BYTES_PER_PACKET as u32)
}

/// Where a bit offset falls among the frames of one packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameLocation {
    /// Frames whose start lies in the packet.
    pub frame_count: u32,
    /// Index of the frame starting at the target offset.
    pub current_frame: u32,
    /// Size in bits of the frame at the target offset; 0 when none starts there.
    pub current_frame_size: u32,
    /// The target lies before the first frame start, in the tail of a frame
    /// carried over from the previous packet.
    pub leading_tail: bool,
}

impl FrameLocation {
    pub fn is_last_frame_in_packet(&self) -> bool {
        if self.leading_tail {
            self.frame_count == 0
        } else {
            self.frame_count > 0 && self.current_frame == self.frame_count - 1
        }
    }
}

/// Counts the frames of `packet` and finds the one starting at `target`.
///
/// `target` is a bit offset relative to the start of the packet.
pub fn locate_frame(packet: &[u8], target: u32) -> Result<FrameLocation, PacketError> {
    if packet.len() != BYTES_PER_PACKET {
        return Err(PacketError::InvalidPacketSize {
            expected: BYTES_PER_PACKET,
            actual: packet.len(),
        });
    }

    let header = PacketHeader::read(packet).map_err(|_| PacketError::InvalidPacketSize {
        expected: BYTES_PER_PACKET,
        actual: packet.len(),
    })?;
    let first_frame_offset = header.first_frame_offset;

    let mut location = FrameLocation::default();

    if target < first_frame_offset {
        location.leading_tail = true;
        location.current_frame_size = first_frame_offset.min(BITS_PER_PACKET) - target;
    }

    let mut reader = BitCursor::new(packet, BITS_PER_PACKET as u64);
    if reader.set_offset(first_frame_offset as u64).is_err() {
        return Ok(location);
    }

    // Every iteration moves the cursor forward by at least one bit or stops.
    while reader.bits_remaining() >= BITS_PER_FRAME_HEADER as u64 {
        let frame_start = reader.offset();
        let Ok(frame_size) = reader.peek(BITS_PER_FRAME_HEADER) else {
            break;
        };

        if frame_size as u32 == FRAME_LENGTH_SENTINEL {
            break;
        }

        if frame_size == 0 {
            warn!("{}", PacketError::ZeroLengthFrame(frame_start));
            break;
        }

        if frame_start == target as u64 {
            location.current_frame = location.frame_count;
            location.current_frame_size = frame_size as u32;
        }

        location.frame_count += 1;

        if frame_size > reader.bits_remaining() {
            // Last frame, continued in the next packet.
            break;
        }

        if reader.advance(frame_size - 1).is_err() {
            break;
        }

        match reader.read_bit() {
            Ok(true) => {}
            _ => break,
        }
    }

    Ok(location)
}
