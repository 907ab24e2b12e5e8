use std::io;

use crate::structs::packet::{BITS_PER_PACKET_HEADER, BYTES_PER_PACKET, BYTES_PER_PACKET_DATA};
use crate::utils::bit_cursor::BitCursor;
use crate::utils::errors::DecodeError;

/// Pad header byte plus the largest frame two packet payloads can carry.
pub const FRAME_BUFFER_SIZE: usize = 1 + 4096;

/// A frame copied out of its packets, in the layout handed to codecs.
///
/// Byte 0 is the pad header `((pad_start & 7) << 5) | ((pad_end & 7) << 2)`.
/// The frame bits follow from byte 1 on, starting `pad_start` bits into the
/// byte, so they keep the alignment they had in the packet.
#[derive(Debug)]
pub struct FrameBuffer {
    payload: Vec<u8>,
    data: Vec<u8>,
    pad_start: u32,
    pad_end: u32,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self {
            payload: vec![0; 2 * BYTES_PER_PACKET_DATA],
            data: vec![0; FRAME_BUFFER_SIZE],
            pad_start: 0,
            pad_end: 0,
        }
    }
}

impl FrameBuffer {
    /// Copies a frame starting at `offset` bits into `packet`.
    ///
    /// `next` is the packet a split frame continues in. Its payload is joined
    /// directly behind the payload of `packet`, skipping its header.
    pub fn assemble(
        &mut self,
        packet: &[u8],
        next: Option<&[u8]>,
        offset: u32,
        size_bits: u32,
    ) -> Result<&[u8], DecodeError> {
        if packet.len() != BYTES_PER_PACKET || offset < BITS_PER_PACKET_HEADER {
            return Err(DecodeError::ReadOffsetOutOfRange {
                offset,
                size: packet.len() as u32,
            });
        }

        self.payload[..BYTES_PER_PACKET_DATA]
            .copy_from_slice(&packet[BYTES_PER_PACKET - BYTES_PER_PACKET_DATA..]);
        let payload_len = match next {
            Some(next) if next.len() == BYTES_PER_PACKET => {
                self.payload[BYTES_PER_PACKET_DATA..]
                    .copy_from_slice(&next[BYTES_PER_PACKET - BYTES_PER_PACKET_DATA..]);
                2 * BYTES_PER_PACKET_DATA
            }
            Some(_) => return Err(DecodeError::SplitFrameUnavailable { offset }),
            None => BYTES_PER_PACKET_DATA,
        };

        let mut reader = BitCursor::from_slice(&self.payload[..payload_len]);
        reader
            .set_offset((offset - BITS_PER_PACKET_HEADER) as u64)
            .map_err(|_| DecodeError::ReadOffsetOutOfRange {
                offset,
                size: payload_len as u32,
            })?;

        if size_bits as u64 > reader.bits_remaining() {
            return Err(if next.is_none() {
                DecodeError::SplitFrameUnavailable { offset }
            } else {
                DecodeError::FrameTooLarge(size_bits)
            });
        }

        let pad_start = (reader.offset() & 7) as u32;
        let len = 1 + (pad_start + size_bits).div_ceil(8) as usize;
        if len > FRAME_BUFFER_SIZE {
            return Err(DecodeError::FrameTooLarge(size_bits));
        }

        self.data[..len].fill(0);
        reader
            .copy(&mut self.data[1..len], size_bits as u64)
            .map_err(|_| DecodeError::FrameTooLarge(size_bits))?;

        let pad_end = (len as u32) * 8 - (8 + pad_start + size_bits);
        self.data[0] = (((pad_start & 7) << 5) | ((pad_end & 7) << 2)) as u8;

        self.pad_start = pad_start;
        self.pad_end = pad_end;

        Ok(&self.data[..len])
    }

    pub fn pad_start(&self) -> u32 {
        self.pad_start
    }

    pub fn pad_end(&self) -> u32 {
        self.pad_end
    }
}

/// Splits an assembled frame into its pad header fields and frame bits.
///
/// Returns `(pad_start, pad_end, size_bits)`.
pub fn frame_padding(frame: &[u8]) -> io::Result<(u32, u32, u32)> {
    let Some((&header, body)) = frame.split_first() else {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "frame is missing its pad header",
        ));
    };

    let pad_start = (header >> 5) as u32 & 7;
    let pad_end = (header >> 2) as u32 & 7;
    let total = (body.len() as u32) << 3;

    if pad_start + pad_end > total {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("pad header {header:#04X} exceeds a {}-byte frame", body.len()),
        ));
    }

    Ok((pad_start, pad_end, total - pad_start - pad_end))
}
