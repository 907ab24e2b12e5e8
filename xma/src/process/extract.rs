use std::sync::Arc;

use log::{Level, trace};

use crate::log_or_err;
use crate::structs::frame::FrameBuffer;
use crate::structs::packet::{
    BITS_PER_PACKET, BITS_PER_PACKET_HEADER, BYTES_PER_PACKET, FRAME_LENGTH_SENTINEL,
    PacketHeader, locate_frame,
};
use crate::utils::errors::{ExtractError, PacketError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    /// The next frame is the first one starting in the current packet.
    PacketStart,
    /// The next frame starts at this bit of the current packet.
    Frame(u32),
}

/// Extracts codec-ready frames from a packet stream.
///
/// Packets are walked in stream order, following each header's skip count.
/// Every frame is copied out with [`FrameBuffer`], joining split frames with
/// the payload of the packet they continue in.
///
/// # Example
///
/// ```rust
/// use xma::process::build::PacketBuilder;
/// use xma::process::extract::Extractor;
///
/// let mut builder = PacketBuilder::new();
/// builder.push_frame(10_000, &[0x12; 8])?;
/// builder.push_frame(9_000, &[0x34; 8])?;
///
/// let mut extractor = Extractor::default();
/// extractor.push_bytes(&builder.build());
///
/// let frames = extractor.filter_map(Result::ok).collect::<Vec<_>>();
/// assert_eq!(frames.len(), 2);
/// assert!(frames[1].split);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct Extractor {
    buffer: Vec<u8>,
    /// Stream index of the packet at the start of `buffer`.
    base_packet: usize,
    packet: usize,
    cursor: Cursor,
    assembler: FrameBuffer,
    io_counter: usize,
    frames_processed: usize,
    fail_level: Level,
}

impl Default for Extractor {
    fn default() -> Self {
        Self {
            buffer: Vec::with_capacity(16 * BYTES_PER_PACKET),
            base_packet: 0,
            packet: 0,
            cursor: Cursor::PacketStart,
            assembler: FrameBuffer::default(),
            io_counter: 0,
            frames_processed: 0,
            fail_level: Level::Error,
        }
    }
}

impl Extractor {
    /// Appends stream bytes. They need not be packet aligned.
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.io_counter += 1;
    }

    /// Stream problems at or above `level` are returned as errors instead of
    /// being logged and skipped.
    pub fn set_fail_level(&mut self, level: Level) {
        self.fail_level = level;
    }

    pub fn frames_processed(&self) -> usize {
        self.frames_processed
    }

    /// Stream index of the packet the next frame is searched in.
    pub fn current_packet(&self) -> usize {
        self.packet
    }

    fn insufficient(&mut self) -> Result<Frame, ExtractError> {
        self.io_counter = self.io_counter.saturating_sub(1);
        Err(ExtractError::InsufficientData)
    }

    fn next_packet(&mut self, header: &PacketHeader) {
        self.packet += header.packets_to_skip() as usize;
        self.cursor = Cursor::PacketStart;
    }

    fn drain_consumed(&mut self) {
        let consumed = (self.packet - self.base_packet).min(self.buffer.len() / BYTES_PER_PACKET);
        if consumed > 0 {
            self.buffer.drain(..consumed * BYTES_PER_PACKET);
            self.base_packet += consumed;
        }
    }

    fn extract(&mut self) -> Result<Frame, ExtractError> {
        loop {
            self.drain_consumed();

            let index = self.packet;
            let Some(packet) = packet_at(&self.buffer, index - self.base_packet) else {
                return self.insufficient();
            };

            let header = PacketHeader::read(packet).map_err(|_| ExtractError::MalformedPacket {
                index,
                source: PacketError::InvalidPacketSize {
                    expected: BYTES_PER_PACKET,
                    actual: packet.len(),
                },
            })?;

            let offset = match self.cursor {
                Cursor::Frame(offset) => offset,
                Cursor::PacketStart if header.has_frame_start() => header.first_frame_offset,
                Cursor::PacketStart => {
                    self.next_packet(&header);

                    if header.first_frame_offset != FRAME_LENGTH_SENTINEL + BITS_PER_PACKET_HEADER {
                        log_or_err!(
                            self,
                            Level::Warn,
                            ExtractError::MalformedPacket {
                                index,
                                source: PacketError::FrameOffsetBeyondPacket {
                                    offset: header.first_frame_offset,
                                    bits: BITS_PER_PACKET,
                                },
                            }
                        );
                    }

                    trace!("Packet {index} holds no frame start");
                    continue;
                }
            };

            let location = match locate_frame(packet, offset) {
                Ok(location) => location,
                Err(source) => {
                    self.next_packet(&header);
                    return Err(ExtractError::MalformedPacket { index, source });
                }
            };

            if location.leading_tail || location.current_frame_size == 0 {
                self.next_packet(&header);
                log_or_err!(self, Level::Warn, ExtractError::NoFrameAtOffset { index, offset });
                continue;
            }

            let size_bits = location.current_frame_size;
            let split = offset + size_bits > BITS_PER_PACKET;
            let next_index = index + header.packets_to_skip() as usize;

            let next = if split {
                let Some(next) = packet_at(&self.buffer, next_index - self.base_packet) else {
                    return self.insufficient();
                };
                Some(next)
            } else {
                None
            };

            let assembled = self
                .assembler
                .assemble(packet, next, offset, size_bits)
                .map(Arc::<[u8]>::from);
            let data = match assembled {
                Ok(data) => data,
                Err(source) => {
                    self.next_packet(&header);
                    return Err(ExtractError::Assembly { index, source });
                }
            };

            let pad_start = self.assembler.pad_start();
            if split || !continuation_bit(&data[1..], pad_start + size_bits - 1) {
                self.packet = next_index;
                self.cursor = Cursor::PacketStart;
            } else {
                self.cursor = Cursor::Frame(offset + size_bits);
            }

            trace!(
                "Frame {} in packet {index} at bit {offset}: {size_bits} bits{}",
                self.frames_processed,
                if split { ", split" } else { "" }
            );
            self.frames_processed += 1;

            return Ok(Frame {
                packet_index: index,
                bit_offset: offset,
                size_bits,
                split,
                pad_start,
                data,
            });
        }
    }
}

impl Iterator for Extractor {
    type Item = Result<Frame, ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.io_counter == 0 {
            return None;
        }

        Some(self.extract())
    }
}

fn packet_at(buffer: &[u8], index: usize) -> Option<&[u8]> {
    buffer.get(index * BYTES_PER_PACKET..(index + 1) * BYTES_PER_PACKET)
}

fn continuation_bit(bits: &[u8], position: u32) -> bool {
    bits.get(position as usize >> 3)
        .is_some_and(|byte| (byte >> (7 - (position & 7))) & 1 == 1)
}

/// One frame of a packet stream, laid out for a codec.
///
/// `data` starts with the pad header byte; see [`FrameBuffer`].
#[derive(Debug, Clone)]
pub struct Frame {
    /// Stream index of the packet the frame starts in.
    pub packet_index: usize,
    /// Bit offset of the frame within that packet, header included.
    pub bit_offset: u32,
    pub size_bits: u32,
    /// The frame continues in the next packet of the stream.
    pub split: bool,
    pub pad_start: u32,
    pub data: Arc<[u8]>,
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
