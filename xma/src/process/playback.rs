//! Playback state shared by the decode worker and the session API.
//!
//! The worker side turns input packets into PCM one frame at a time
//! ([`PlaybackState::decode_frame`]) and drains that PCM into the output ring
//! a few sub-blocks at a time ([`PlaybackState::consume_step`]). The caller
//! side queues input buffers and reads the ring back out. Both sides run under
//! the session mutex; nothing here locks on its own.

use std::sync::Arc;

use anyhow::{Result, bail};
use log::{debug, trace, warn};

use crate::codec::{DecodedFrame, FrameCodec, SAMPLES_PER_FRAME};
use crate::config::{OUTPUT_BYTES_PER_BLOCK, SessionConfig};
use crate::memory::{GuestMemory, GuestRegion};
use crate::structs::frame::FrameBuffer;
use crate::structs::packet::{
    BITS_PER_PACKET, BITS_PER_PACKET_HEADER, BYTES_PER_PACKET, BYTES_PER_PACKET_HEADER,
    PacketHeader, locate_frame, packet_number,
};
use crate::utils::errors::{CreateError, DecodeError, MemoryError, PlaybackError};
use crate::utils::ring_buffer::RingBuffer;

/// Sub-blocks of PCM one decoded frame yields per channel.
pub const SUBFRAMES_PER_CHANNEL: u32 = 4;

/// Width of the hardware offset registers.
pub const OFFSET_MASK: u32 = 0x03FF_FFFF;

pub const INFINITE_LOOPS: u8 = 255;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InputSlot {
    #[default]
    First,
    Second,
}

impl InputSlot {
    pub fn toggle(self) -> Self {
        match self {
            InputSlot::First => InputSlot::Second,
            InputSlot::Second => InputSlot::First,
        }
    }

    fn index(self) -> usize {
        match self {
            InputSlot::First => 0,
            InputSlot::Second => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputBuffer {
    pub handle: u32,
    pub packet_count: u32,
    pub valid: bool,
}

impl InputBuffer {
    pub fn size_bytes(&self) -> u32 {
        self.packet_count * BYTES_PER_PACKET as u32
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopParams {
    pub start_offset: u32,
    pub end_offset: u32,
    pub subframe_end: u8,
    pub subframe_skip: u8,
    /// Remaining loops; [`INFINITE_LOOPS`] never runs out.
    pub loop_count: u8,
}

/// Output ring geometry, counted in 256-byte blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutputGeometry {
    handle: u32,
    block_count: u32,
    read_block: u32,
    write_block: u32,
    /// Cleared when the ring is full, so equal cursors are not read as empty.
    valid: bool,
    partial_bytes_read: u32,
}

/// PCM handed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedData {
    /// Guest address of the first unread byte.
    pub address: u32,
    pub samples: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStep {
    /// Nothing to do: no input, or PCM of the last frame is still undrained.
    Idle,
    /// The current input buffer ran out and the other one became current.
    Swapped,
    /// The read offset moved past packets without a frame start.
    Skipped,
    Decoded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextRead {
    Offset(u32),
    BufferStart,
}

pub struct PlaybackState {
    channel_count: u32,
    subframes: u32,

    inputs: [InputBuffer; 2],
    current: InputSlot,
    input_read_offset: u32,

    loop_params: LoopParams,
    subframes_to_skip: u8,

    current_frame_remaining_subframes: u32,
    free_blocks: u32,
    batch_written: u32,
    output: OutputGeometry,

    stream_position: u32,
    error_bits: u32,

    pub(crate) locked: bool,
    pub(crate) running: bool,
    pub(crate) decode_allowed: bool,

    memory: Arc<dyn GuestMemory>,
    packet: Vec<u8>,
    next_packet: Vec<u8>,
    frame: FrameBuffer,
    raw_frame: Vec<u8>,
}

impl PlaybackState {
    pub fn new(
        config: &SessionConfig,
        output_handle: u32,
        memory: Arc<dyn GuestMemory>,
    ) -> Result<Self, CreateError> {
        let block_count = config.validate()?;

        Ok(Self {
            channel_count: config.channel_count,
            subframes: config.subframes,
            inputs: [InputBuffer::default(); 2],
            current: InputSlot::default(),
            input_read_offset: BITS_PER_PACKET_HEADER,
            loop_params: LoopParams::default(),
            subframes_to_skip: 0,
            current_frame_remaining_subframes: 0,
            free_blocks: 0,
            batch_written: 0,
            output: OutputGeometry {
                handle: output_handle,
                block_count,
                read_block: 0,
                write_block: 0,
                valid: true,
                partial_bytes_read: 0,
            },
            stream_position: 0,
            error_bits: 0,
            locked: false,
            running: true,
            decode_allowed: false,
            memory,
            packet: vec![0; BYTES_PER_PACKET],
            next_packet: vec![0; BYTES_PER_PACKET],
            frame: FrameBuffer::default(),
            raw_frame: vec![
                0;
                (SUBFRAMES_PER_CHANNEL * config.channel_count * OUTPUT_BYTES_PER_BLOCK)
                    as usize
            ],
        })
    }

    pub fn input(&self, slot: InputSlot) -> InputBuffer {
        self.inputs[slot.index()]
    }

    pub fn current_slot(&self) -> InputSlot {
        self.current
    }

    fn current_input(&self) -> InputBuffer {
        self.inputs[self.current.index()]
    }

    pub fn any_input_valid(&self) -> bool {
        self.inputs.iter().any(|input| input.valid)
    }

    pub fn input_read_offset(&self) -> u32 {
        self.input_read_offset
    }

    pub fn remaining_subframes(&self) -> u32 {
        self.current_frame_remaining_subframes
    }

    pub fn loop_params(&self) -> LoopParams {
        self.loop_params
    }

    pub fn subframes_to_skip(&self) -> u8 {
        self.subframes_to_skip
    }

    pub fn stream_position(&self) -> u32 {
        self.stream_position
    }

    pub fn error_bits(&self) -> u32 {
        self.error_bits
    }

    pub(crate) fn record_error(&mut self, bits: u32) {
        self.error_bits |= bits;
    }

    pub fn output_handle(&self) -> u32 {
        self.output.handle
    }

    pub fn output_write_block(&self) -> u32 {
        self.output.write_block
    }

    pub fn output_read_block(&self) -> u32 {
        self.output.read_block
    }

    pub fn output_valid(&self) -> bool {
        self.output.valid
    }

    fn min_decode_blocks(&self) -> u32 {
        (self.subframes * self.channel_count).saturating_sub(1)
    }

    /// Worker wake condition, short of the stop request.
    pub(crate) fn can_decode(&self) -> bool {
        self.decode_allowed
            && self.output.valid
            && (self.any_input_valid() || self.current_frame_remaining_subframes > 0)
            && !self.locked
    }

    fn packet_address(handle: u32, index: u32) -> Result<u32, MemoryError> {
        index
            .checked_mul(BYTES_PER_PACKET as u32)
            .and_then(|offset| handle.checked_add(offset))
            .ok_or(MemoryError::Unmapped {
                address: handle,
                len: BYTES_PER_PACKET,
            })
    }

    fn read_header(&self, handle: u32, index: u32) -> Result<PacketHeader> {
        let mut raw = [0u8; BYTES_PER_PACKET_HEADER];
        self.memory.read(Self::packet_address(handle, index)?, &mut raw)?;

        Ok(PacketHeader::read(&raw)?)
    }

    /// Invalidates the current slot and makes the other one current.
    fn swap_input_buffers(&mut self) {
        self.inputs[self.current.index()].valid = false;
        self.current = self.current.toggle();
        self.input_read_offset = BITS_PER_PACKET_HEADER;

        debug!(
            "Input buffer drained, switched to {:?} slot (valid: {})",
            self.current,
            self.current_input().valid
        );
    }

    pub(crate) fn update_loop_status(&mut self) {
        let params = &mut self.loop_params;
        if params.loop_count == 0 {
            return;
        }

        let loop_start = params.start_offset.max(BITS_PER_PACKET_HEADER);
        let loop_end = params.end_offset.max(BITS_PER_PACKET_HEADER);

        if self.input_read_offset != loop_end {
            return;
        }

        self.input_read_offset = loop_start;
        if params.loop_count != INFINITE_LOOPS {
            params.loop_count -= 1;
        }

        debug!(
            "Loop end {loop_end} reached, back to {loop_start} ({} loops left)",
            params.loop_count
        );
    }

    /// First packet at or after `index` with a frame start, as a read offset.
    fn next_packet_read_offset(&self, input: &InputBuffer, index: u32) -> Result<NextRead> {
        for index in index..input.packet_count {
            let header = self.read_header(input.handle, index)?;
            if header.has_frame_start() {
                return Ok(NextRead::Offset(
                    index * BITS_PER_PACKET + header.first_frame_offset,
                ));
            }

            trace!("Packet {index} holds no frame start, skipped");
        }

        Ok(NextRead::BufferStart)
    }

    /// Loads the packet a split frame continues in.
    fn fetch_next_packet(&mut self, index: u32, input: &InputBuffer) -> Result<bool> {
        let (handle, index) = if index < input.packet_count {
            (input.handle, index)
        } else {
            let other = self.inputs[self.current.toggle().index()];
            if !other.valid {
                return Ok(false);
            }

            if other.handle == 0 {
                bail!(DecodeError::MissingInputBuffer);
            }

            (other.handle, 0)
        };

        let address = Self::packet_address(handle, index)?;
        self.memory.read(address, &mut self.next_packet)?;

        Ok(true)
    }

    /// Decodes the frame at the input read offset into the PCM scratch area.
    pub fn decode_frame(&mut self, codec: &mut dyn FrameCodec) -> Result<DecodeStep> {
        if !self.any_input_valid() || self.current_frame_remaining_subframes > 0 {
            return Ok(DecodeStep::Idle);
        }

        if !self.current_input().valid {
            self.swap_input_buffers();
            return Ok(DecodeStep::Swapped);
        }

        self.update_loop_status();

        let input = self.current_input();
        let Some(packet_index) = packet_number(input.size_bytes(), self.input_read_offset) else {
            bail!(DecodeError::ReadOffsetOutOfRange {
                offset: self.input_read_offset,
                size: input.size_bytes(),
            });
        };

        let address = Self::packet_address(input.handle, packet_index)?;
        self.memory.read(address, &mut self.packet)?;
        let header = PacketHeader::read(&self.packet)?;

        if packet_index == 0 && self.input_read_offset < header.first_frame_offset {
            if !header.has_frame_start() {
                return self.requalify_from(&input, 1);
            }

            self.input_read_offset = header.first_frame_offset;
        }

        let relative_offset = self.input_read_offset % BITS_PER_PACKET;
        let location = locate_frame(&self.packet, relative_offset)?;
        let next_packet_index = packet_index + header.packets_to_skip();

        let bits_remaining = (packet_index + 1) * BITS_PER_PACKET - self.input_read_offset;
        let bits_to_copy = bits_remaining.min(location.current_frame_size);

        if bits_to_copy == 0 {
            self.swap_input_buffers();
            return Ok(DecodeStep::Swapped);
        }

        let split = location.is_last_frame_in_packet() && bits_remaining < location.current_frame_size;
        if split && !self.fetch_next_packet(next_packet_index, &input)? {
            bail!(DecodeError::SplitFrameUnavailable {
                offset: self.input_read_offset,
            });
        }

        let next = split.then_some(self.next_packet.as_slice());
        let frame = self
            .frame
            .assemble(&self.packet, next, relative_offset, location.current_frame_size)?;

        trace!(
            "Frame {} of packet {packet_index} at bit {} ({} bits{})",
            location.current_frame,
            self.input_read_offset,
            location.current_frame_size,
            if split { ", split" } else { "" }
        );

        let decoded = match codec.decode(frame) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!(
                    "Codec failed on frame at bit {}, emitting silence: {e}",
                    self.input_read_offset
                );
                None
            }
        };
        self.write_raw_frame(decoded.as_ref());
        self.current_frame_remaining_subframes = SUBFRAMES_PER_CHANNEL * self.channel_count;

        if !location.is_last_frame_in_packet() {
            let next_frame_offset = (self.input_read_offset + bits_to_copy) % BITS_PER_PACKET;
            self.input_read_offset = packet_index * BITS_PER_PACKET + next_frame_offset;
            return Ok(DecodeStep::Decoded);
        }

        self.requalify_from(&input, next_packet_index)?;
        Ok(DecodeStep::Decoded)
    }

    /// Moves the read offset to the next frame start at or after packet `index`,
    /// switching input buffers when this one has none left.
    fn requalify_from(&mut self, input: &InputBuffer, index: u32) -> Result<DecodeStep> {
        if let NextRead::Offset(offset) = self.next_packet_read_offset(input, index)? {
            self.input_read_offset = offset;
            return Ok(DecodeStep::Skipped);
        }

        self.swap_input_buffers();

        let input = self.current_input();
        if !input.valid {
            return Ok(DecodeStep::Swapped);
        }

        let header = self.read_header(input.handle, 0)?;
        if header.has_frame_start() {
            self.input_read_offset = header.first_frame_offset;
        } else {
            self.swap_input_buffers();
        }

        Ok(DecodeStep::Swapped)
    }

    /// Interleaves a decoded frame into big-endian 16-bit PCM.
    fn write_raw_frame(&mut self, frame: Option<&DecodedFrame>) {
        let channels = self.channel_count as usize;

        for i in 0..SAMPLES_PER_FRAME {
            for ch in 0..channels {
                let sample = frame
                    .and_then(|frame| frame.channels.get(ch))
                    .and_then(|samples| samples.get(i))
                    .copied()
                    .unwrap_or(0.0);

                let at = (i * channels + ch) * 2;
                self.raw_frame[at..at + 2].copy_from_slice(&to_pcm16(sample).to_be_bytes());
            }
        }
    }

    fn output_ring(&self) -> RingBuffer<GuestRegion> {
        let capacity = self.output.block_count * OUTPUT_BYTES_PER_BLOCK;
        let region = GuestRegion::new(self.memory.clone(), self.output.handle, capacity);

        let mut ring = RingBuffer::new(region, capacity);
        ring.set_read_offset((self.output.read_block * OUTPUT_BYTES_PER_BLOCK) as usize);
        ring.set_write_offset((self.output.write_block * OUTPUT_BYTES_PER_BLOCK) as usize);
        ring
    }

    /// Recomputes the free output space; false when a batch cannot start.
    pub fn begin_batch(&mut self) -> bool {
        self.batch_written = 0;
        self.free_blocks = if self.output.valid {
            self.output_ring().write_count() / OUTPUT_BYTES_PER_BLOCK
        } else {
            0
        };

        self.has_room()
    }

    pub fn has_room(&self) -> bool {
        self.free_blocks >= self.min_decode_blocks()
    }

    /// Drains up to one step of sub-blocks from the PCM scratch into the ring.
    pub fn consume_step(&mut self) -> Result<u32> {
        let blocks = self
            .current_frame_remaining_subframes
            .min(self.subframes)
            .min(self.free_blocks);
        if blocks == 0 {
            return Ok(0);
        }

        let total = SUBFRAMES_PER_CHANNEL * self.channel_count;
        let start = ((total - self.current_frame_remaining_subframes) * OUTPUT_BYTES_PER_BLOCK) as usize;
        let len = (blocks * OUTPUT_BYTES_PER_BLOCK) as usize;

        let mut ring = self.output_ring();
        ring.write(&self.raw_frame[start..start + len])?;
        self.output.write_block = ring.write_offset() / OUTPUT_BYTES_PER_BLOCK;

        // Writing up to the read cursor fills the ring.
        if self.output.write_block == self.output.read_block {
            self.output.valid = false;
            debug!("Output ring full at block {}", self.output.write_block);
        }

        self.current_frame_remaining_subframes -= blocks;
        self.free_blocks -= blocks;
        self.batch_written += blocks;

        Ok(blocks)
    }

    pub fn finish_batch(&mut self) {
        debug!(
            "Decode batch done: {} blocks written, {} free",
            self.batch_written, self.free_blocks
        );
        self.decode_allowed = false;
    }

    fn require_lock(&self) -> Result<(), PlaybackError> {
        if self.locked {
            Ok(())
        } else {
            Err(PlaybackError::NotLocked)
        }
    }

    /// Queues an input buffer of whole packets.
    pub fn submit(&mut self, handle: u32, size: u32) -> Result<(), PlaybackError> {
        self.require_lock()?;

        if handle == 0 {
            return Err(PlaybackError::NullBuffer);
        }

        let packet_count = (size >> 11) & 0xFFF;
        if packet_count == 0 {
            return Err(PlaybackError::EmptyBuffer(size));
        }

        let current = self.current;
        let slot = match (self.inputs[current.index()].valid, self.inputs[current.toggle().index()].valid) {
            (true, true) => return Err(PlaybackError::BufferFull),
            (false, false) => current,
            (true, false) => current.toggle(),
            (false, true) => {
                // The queued buffer plays first.
                self.current = current.toggle();
                current
            }
        };

        if !self.any_input_valid() {
            let mut raw = [0u8; BYTES_PER_PACKET_HEADER];
            self.memory.read(handle, &mut raw)?;

            self.input_read_offset = match PacketHeader::read(&raw) {
                Ok(header) if header.has_frame_start() => header.first_frame_offset & OFFSET_MASK,
                _ => BITS_PER_PACKET_HEADER,
            };
        }

        self.inputs[slot.index()] = InputBuffer {
            handle,
            packet_count,
            valid: true,
        };
        self.decode_allowed = true;

        debug!("Queued {packet_count} packet(s) at {handle:#010X} in {slot:?} slot");

        Ok(())
    }

    pub fn ready_for_more_data(&self) -> bool {
        self.inputs.iter().any(|input| !input.valid)
    }

    pub fn is_idle(&self) -> bool {
        !self.any_input_valid()
    }

    pub fn input_data_pending(&self, handle: u32) -> bool {
        self.inputs
            .iter()
            .any(|input| input.valid && input.handle == handle)
    }

    /// Contiguous readable blocks from `read`, not counting a wrap.
    fn available_blocks(&self, read: u32, valid: bool) -> u32 {
        let write = self.output.write_block;

        if write <= read {
            if write < read || !valid {
                self.output.block_count.saturating_sub(read)
            } else {
                0
            }
        } else {
            write - read
        }
    }

    fn read_address(&self) -> u32 {
        self.output.handle
            + ((self.output.read_block << 8) & 0x1F00)
            + self.output.partial_bytes_read
    }

    /// Samples readable from the ring, per channel.
    ///
    /// Unlike the hardware query this does not require the lock and still
    /// reports ring contents once every input buffer has drained.
    pub fn available_samples(&self) -> u32 {
        let mut read = self.output.read_block;
        let mut valid = self.output.valid;
        let mut bytes = 0;

        if self.output.partial_bytes_read > 0 {
            bytes = OUTPUT_BYTES_PER_BLOCK - self.output.partial_bytes_read;
            read += 1;
            valid = true;
        }

        let total = (self.available_blocks(read, valid) << 8) + bytes;
        total >> self.channel_count
    }

    pub fn access_decoded_data(&self) -> Result<DecodedData, PlaybackError> {
        self.require_lock()?;

        Ok(DecodedData {
            address: self.read_address(),
            samples: self.available_samples(),
        })
    }

    fn advance_read_block(&mut self, blocks: u32) {
        let count = self.output.block_count;
        self.output.read_block = (self.output.read_block + blocks) % count;
        self.output.valid = true;
    }

    pub fn consume_decoded_data(&mut self, max_samples: u32) -> Result<DecodedData, PlaybackError> {
        self.require_lock()?;

        let address = self.read_address();
        let mut desired = ((max_samples as u64) << self.channel_count).min(u32::MAX as u64) as u32;
        let mut total = 0;

        let partial = self.output.partial_bytes_read;
        if partial > 0 {
            let left = OUTPUT_BYTES_PER_BLOCK - partial;
            if desired < left {
                total = desired;
                self.output.partial_bytes_read += desired;
                desired = 0;
            } else {
                total = left;
                desired -= left;
                self.output.partial_bytes_read = 0;
                self.advance_read_block(1);
            }
        }

        let mut available = self.available_blocks(self.output.read_block, self.output.valid);
        let blocks = (desired >> 8).min(available);
        if blocks > 0 {
            total += blocks << 8;
            available -= blocks;
            self.advance_read_block(blocks);
        }

        let remaining = desired & 0xFF;
        if remaining > 0 && available > 0 {
            total += remaining;
            self.output.partial_bytes_read = remaining;
        }

        let samples = total >> self.channel_count;
        self.stream_position = self.stream_position.wrapping_add(samples);

        trace!("Consumed {samples} samples, stream position {}", self.stream_position);

        Ok(DecodedData { address, samples })
    }

    pub fn set_loop(&mut self, params: LoopParams) -> Result<(), PlaybackError> {
        self.require_lock()?;

        self.loop_params = LoopParams {
            start_offset: params.start_offset & OFFSET_MASK,
            end_offset: params.end_offset & OFFSET_MASK,
            ..params
        };

        Ok(())
    }

    pub fn set_decode_position(&mut self, bit_offset: u32, subframe: u32) -> Result<(), PlaybackError> {
        self.require_lock()?;

        self.input_read_offset = bit_offset & OFFSET_MASK;
        self.subframes_to_skip = (subframe & 7) as u8;

        Ok(())
    }

    /// Moves the output write cursor back by `samples`.
    ///
    /// Returns false when the rewind reaches past the whole ring, in which
    /// case all unread output is dropped.
    pub fn rewind_decode_position(&mut self, samples: u32) -> Result<bool, PlaybackError> {
        self.require_lock()?;

        let blocks = samples >> (8 - self.channel_count);
        let count = self.output.block_count;
        self.output.valid = true;

        if blocks >= count {
            self.output.write_block = self.output.read_block;
            return Ok(false);
        }

        self.output.write_block = (self.output.write_block + count - blocks) % count;
        Ok(true)
    }

    /// Drops queued input and PCM not yet drained into the ring.
    pub fn flush(&mut self) -> Result<(), PlaybackError> {
        self.require_lock()?;

        for input in &mut self.inputs {
            input.valid = false;
        }
        self.current_frame_remaining_subframes = 0;
        self.input_read_offset = BITS_PER_PACKET_HEADER;
        self.decode_allowed = false;

        debug!("Flushed input buffers");

        Ok(())
    }
}

fn to_pcm16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }

    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecFactory, SilenceCodec};
    use crate::config::OUTPUT_ALLOCATION_SIZE;
    use crate::memory::HeapMemory;
    use crate::process::build::PacketBuilder;
    use crate::structs::frame::frame_padding;
    use crate::structs::packet::BITS_PER_FRAME_HEADER;
    use crate::utils::bit_cursor::BitCursor;
    use crate::utils::errors::CodecError;

    /// Emits every sample as the first payload byte of the frame divided by 256.
    struct TagCodec;

    impl FrameCodec for TagCodec {
        fn decode(&mut self, frame: &[u8]) -> Result<DecodedFrame, CodecError> {
            let (pad_start, _, _) =
                frame_padding(frame).map_err(|e| CodecError::InvalidFrame(e.to_string()))?;

            let mut reader = BitCursor::from_slice(&frame[1..]);
            let tag = reader
                .advance((pad_start + BITS_PER_FRAME_HEADER) as u64)
                .and_then(|_| reader.read(8))
                .map_err(|e| CodecError::InvalidFrame(e.to_string()))?;

            Ok(DecodedFrame {
                channels: vec![vec![tag as f32 / 256.0; SAMPLES_PER_FRAME]; 2],
            })
        }
    }

    fn tag_pcm(tag: u8) -> [u8; 2] {
        to_pcm16(tag as f32 / 256.0).to_be_bytes()
    }

    struct Fixture {
        memory: Arc<HeapMemory>,
        state: PlaybackState,
    }

    impl Fixture {
        fn new(config: SessionConfig) -> anyhow::Result<Self> {
            let memory = Arc::new(HeapMemory::new(0x10_0000));
            let output = memory.alloc(OUTPUT_ALLOCATION_SIZE)?;
            let mut state = PlaybackState::new(&config, output, memory.clone())?;
            state.locked = true;

            Ok(Self { memory, state })
        }

        fn stereo() -> anyhow::Result<Self> {
            Self::new(SessionConfig::default())
        }

        fn submit(&mut self, stream: &[u8]) -> anyhow::Result<u32> {
            let handle = self.memory.store(stream)?;
            self.state.submit(handle, stream.len() as u32)?;
            Ok(handle)
        }

        /// Drains the current frame's PCM into the ring, reading the ring
        /// out whenever it runs out of space.
        fn drain(&mut self) -> anyhow::Result<()> {
            while self.state.remaining_subframes() > 0 {
                if self.step()? == 0 {
                    self.state.consume_decoded_data(u32::MAX)?;
                    anyhow::ensure!(self.step()? > 0, "output ring stuck");
                }
            }
            Ok(())
        }

        fn step(&mut self) -> anyhow::Result<u32> {
            self.state.begin_batch();
            let written = self.state.consume_step()?;
            self.state.finish_batch();
            Ok(written)
        }

        fn output_bytes(&self, address: u32, len: usize) -> anyhow::Result<Vec<u8>> {
            let mut out = vec![0; len];
            self.memory.read(address, &mut out)?;
            Ok(out)
        }
    }

    fn stream(frames: &[(u32, u8)]) -> anyhow::Result<Vec<u8>> {
        let mut builder = PacketBuilder::new();
        for &(size, tag) in frames {
            builder.push_frame(size, &[tag; 2048])?;
        }
        Ok(builder.build())
    }

    #[test]
    fn undrained_pcm_blocks_decoding() -> anyhow::Result<()> {
        let mut f = Fixture::stereo()?;
        f.submit(&stream(&[(3000, 1), (3000, 2)])?)?;
        let mut codec = SilenceCodec::factory().open(48_000, 2)?;

        assert_eq!(f.state.decode_frame(codec.as_mut())?, DecodeStep::Decoded);
        assert_eq!(f.state.remaining_subframes(), 8);
        let offset = f.state.input_read_offset();

        assert_eq!(f.state.decode_frame(codec.as_mut())?, DecodeStep::Idle);
        assert_eq!(f.state.input_read_offset(), offset);

        assert!(f.state.begin_batch());
        assert_eq!(f.state.consume_step()?, 4);
        assert_eq!(f.state.remaining_subframes(), 4);
        assert_eq!(f.state.decode_frame(codec.as_mut())?, DecodeStep::Idle);

        assert_eq!(f.state.consume_step()?, 4);
        assert_eq!(f.state.remaining_subframes(), 0);
        assert_eq!(f.state.output_write_block(), 8);

        assert_eq!(f.state.decode_frame(codec.as_mut())?, DecodeStep::Decoded);
        assert_eq!(f.state.input_read_offset(), BITS_PER_PACKET_HEADER);

        Ok(())
    }

    #[test]
    fn loop_wraps_until_count_runs_out() -> anyhow::Result<()> {
        let mut f = Fixture::stereo()?;
        f.state.set_loop(LoopParams {
            start_offset: 64,
            end_offset: 4096,
            loop_count: 2,
            ..Default::default()
        })?;

        for left in [1, 0] {
            f.state.set_decode_position(4096, 0)?;
            f.state.update_loop_status();
            assert_eq!(f.state.input_read_offset(), 64);
            assert_eq!(f.state.loop_params().loop_count, left);
        }

        f.state.set_decode_position(4096, 0)?;
        f.state.update_loop_status();
        assert_eq!(f.state.input_read_offset(), 4096);

        Ok(())
    }

    #[test]
    fn infinite_loop_keeps_its_count() -> anyhow::Result<()> {
        let mut f = Fixture::stereo()?;
        f.state.set_loop(LoopParams {
            start_offset: 0xFC00_0000 | 10,
            end_offset: 2000,
            loop_count: INFINITE_LOOPS,
            ..Default::default()
        })?;

        assert_eq!(f.state.loop_params().start_offset, 10);
        f.state.set_decode_position(2000, 9)?;
        assert_eq!(f.state.subframes_to_skip(), 1);

        f.state.update_loop_status();
        // Loop points below the first packet header clamp to it.
        assert_eq!(f.state.input_read_offset(), BITS_PER_PACKET_HEADER);
        assert_eq!(f.state.loop_params().loop_count, INFINITE_LOOPS);

        Ok(())
    }

    #[test]
    fn buffers_swap_and_third_submission_is_rejected() -> anyhow::Result<()> {
        let mut f = Fixture::stereo()?;
        let a = f.submit(&stream(&[(2000, 1), (2000, 2)])?)?;
        let b = f.submit(&stream(&[(2000, 3)])?)?;

        assert_eq!(f.state.input(InputSlot::First).handle, a);
        assert_eq!(f.state.input(InputSlot::Second).handle, b);
        assert!(!f.state.ready_for_more_data());

        let third = f.memory.store(&stream(&[(2000, 4)])?)?;
        assert_eq!(
            f.state.submit(third, BYTES_PER_PACKET as u32),
            Err(PlaybackError::BufferFull)
        );

        let mut codec = TagCodec;
        for _ in 0..2 {
            assert_eq!(f.state.decode_frame(&mut codec)?, DecodeStep::Decoded);
            f.drain()?;
        }

        // Last frame of the only packet: the second buffer became current.
        assert_eq!(f.state.current_slot(), InputSlot::Second);
        assert!(!f.state.input(InputSlot::First).valid);
        assert!(f.state.ready_for_more_data());
        assert!(f.state.input_data_pending(b));
        assert!(!f.state.input_data_pending(a));

        f.state.submit(third, BYTES_PER_PACKET as u32)?;
        assert_eq!(f.state.input(InputSlot::First).handle, third);

        assert_eq!(f.state.decode_frame(&mut codec)?, DecodeStep::Decoded);
        f.drain()?;
        assert_eq!(f.state.current_slot(), InputSlot::First);

        // The ring was full, so the third frame starts over at block 0.
        assert_eq!(f.output_bytes(f.state.output_handle(), 2)?, tag_pcm(3));

        Ok(())
    }

    #[test]
    fn split_frame_continues_in_next_buffer() -> anyhow::Result<()> {
        let packets = stream(&[(16_000, 1), (2_000, 2), (700, 3)])?;
        let (first, second) = packets.split_at(BYTES_PER_PACKET);

        let mut f = Fixture::stereo()?;
        f.submit(first)?;

        let base = f.state.output_handle();
        let mut codec = TagCodec;
        assert_eq!(f.state.decode_frame(&mut codec)?, DecodeStep::Decoded);
        f.drain()?;
        assert_eq!(f.output_bytes(base, 2)?, tag_pcm(1));

        let offset = f.state.input_read_offset();
        let err = f.state.decode_frame(&mut codec).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::SplitFrameUnavailable { .. })
        ));
        assert_eq!(f.state.input_read_offset(), offset);
        assert_eq!(f.state.remaining_subframes(), 0);

        f.submit(second)?;
        assert_eq!(f.state.decode_frame(&mut codec)?, DecodeStep::Decoded);
        f.drain()?;
        assert_eq!(f.state.current_slot(), InputSlot::Second);
        assert_eq!(
            f.state.input_read_offset(),
            BITS_PER_PACKET_HEADER + 16_000 + 2_000 - (BITS_PER_PACKET - BITS_PER_PACKET_HEADER)
        );

        assert_eq!(f.state.decode_frame(&mut codec)?, DecodeStep::Decoded);
        f.drain()?;
        assert!(f.state.is_idle());

        assert_eq!(f.output_bytes(base + 8 * 256, 2)?, tag_pcm(2));
        // Third frame wrapped to the start of the 16-block ring.
        assert_eq!(f.output_bytes(base, 2)?, tag_pcm(3));

        Ok(())
    }

    #[test]
    fn partial_reads_track_stream_position() -> anyhow::Result<()> {
        let mut f = Fixture::stereo()?;
        f.submit(&stream(&[(3000, 7)])?)?;

        let mut codec = TagCodec;
        f.state.decode_frame(&mut codec)?;
        f.drain()?;
        assert_eq!(f.state.available_samples(), 8 * 64);

        let base = f.state.output_handle();
        let data = f.state.consume_decoded_data(10)?;
        assert_eq!(data, DecodedData { address: base, samples: 10 });
        assert_eq!(f.state.access_decoded_data()?.address, base + 40);
        assert_eq!(f.state.available_samples(), 8 * 64 - 10);

        let data = f.state.consume_decoded_data(100)?;
        assert_eq!(data.samples, 100);
        assert_eq!(f.state.output_read_block(), 1);
        assert_eq!(f.state.access_decoded_data()?.address, base + 256 + 184);
        assert_eq!(f.state.stream_position(), 110);

        let data = f.state.consume_decoded_data(10_000)?;
        assert_eq!(data.samples, 8 * 64 - 110);
        assert_eq!(f.state.available_samples(), 0);
        assert_eq!(f.state.stream_position(), 8 * 64);

        Ok(())
    }

    #[test]
    fn full_ring_is_not_mistaken_for_empty() -> anyhow::Result<()> {
        let mut f = Fixture::stereo()?;
        f.submit(&stream(&[(1000, 1), (1000, 2), (1000, 3)])?)?;

        let mut codec = TagCodec;
        assert!(f.state.begin_batch());
        for _ in 0..2 {
            f.state.decode_frame(&mut codec)?;
            while f.state.consume_step()? > 0 {}
        }
        f.state.finish_batch();

        assert_eq!(f.state.output_write_block(), f.state.output_read_block());
        assert!(!f.state.output_valid());
        assert!(!f.state.can_decode());
        assert_eq!(f.state.available_samples(), 16 * 64);

        f.state.consume_decoded_data(64)?;
        assert!(f.state.output_valid());
        assert_eq!(f.state.available_samples(), 15 * 64);

        Ok(())
    }

    #[test]
    fn drain_mid_batch_leaves_ring_empty() -> anyhow::Result<()> {
        let mut f = Fixture::stereo()?;
        f.submit(&stream(&[(1000, 1), (1000, 2)])?)?;

        let mut codec = TagCodec;
        assert!(f.state.begin_batch());
        f.state.decode_frame(&mut codec)?;
        assert_eq!(f.state.consume_step()?, 4);

        // A caller takes the lock between two steps and reads everything.
        let data = f.state.consume_decoded_data(u32::MAX)?;
        assert_eq!(data.samples, 4 * 64);
        assert_eq!(f.state.output_read_block(), f.state.output_write_block());

        f.state.finish_batch();
        assert!(f.state.output_valid());
        assert_eq!(f.state.available_samples(), 0);

        f.state.locked = false;
        f.state.decode_allowed = true;
        assert!(f.state.can_decode());

        Ok(())
    }

    #[test]
    fn sentinel_padding_swaps_buffers() -> anyhow::Result<()> {
        let mut f = Fixture::stereo()?;
        f.submit(&stream(&[(2000, 1)])?)?;
        let b = f.submit(&stream(&[(2000, 2)])?)?;

        // The frame data of the first buffer ends at bit 2032.
        f.state.set_decode_position(BITS_PER_PACKET_HEADER + 2000, 0)?;

        let mut codec = TagCodec;
        assert_eq!(f.state.decode_frame(&mut codec)?, DecodeStep::Swapped);
        assert!(!f.state.input(InputSlot::First).valid);
        assert_eq!(f.state.current_slot(), InputSlot::Second);
        assert_eq!(f.state.input(InputSlot::Second).handle, b);
        assert_eq!(f.state.input_read_offset(), BITS_PER_PACKET_HEADER);
        assert_eq!(f.state.remaining_subframes(), 0);

        assert_eq!(f.state.decode_frame(&mut codec)?, DecodeStep::Decoded);
        f.drain()?;
        assert_eq!(f.output_bytes(f.state.output_handle(), 2)?, tag_pcm(2));

        Ok(())
    }

    #[test]
    fn invalid_current_slot_is_swapped_out() -> anyhow::Result<()> {
        let mut f = Fixture::stereo()?;
        f.submit(&stream(&[(2000, 1)])?)?;
        f.submit(&stream(&[(2000, 2)])?)?;
        f.state.inputs[InputSlot::First.index()].valid = false;
        f.state.input_read_offset = 5000;

        let mut codec = TagCodec;
        assert_eq!(f.state.decode_frame(&mut codec)?, DecodeStep::Swapped);
        assert_eq!(f.state.current_slot(), InputSlot::Second);
        assert_eq!(f.state.input_read_offset(), BITS_PER_PACKET_HEADER);

        assert_eq!(f.state.decode_frame(&mut codec)?, DecodeStep::Decoded);
        f.drain()?;
        assert_eq!(f.output_bytes(f.state.output_handle(), 2)?, tag_pcm(2));
        assert!(f.state.is_idle());

        Ok(())
    }

    #[test]
    fn decoding_follows_the_loop() -> anyhow::Result<()> {
        let mut f = Fixture::stereo()?;
        f.submit(&stream(&[(2000, 1), (2000, 2), (2000, 3)])?)?;
        f.state.set_loop(LoopParams {
            start_offset: 2032,
            end_offset: 4032,
            loop_count: 1,
            ..Default::default()
        })?;

        let base = f.state.output_handle();
        let mut codec = TagCodec;
        let mut decode = |f: &mut Fixture| -> anyhow::Result<Vec<u8>> {
            assert_eq!(f.state.decode_frame(&mut codec)?, DecodeStep::Decoded);
            let block = f.state.output_write_block();
            f.drain()?;
            f.output_bytes(base + block * OUTPUT_BYTES_PER_BLOCK, 2)
        };

        assert_eq!(decode(&mut f)?, tag_pcm(1));
        assert_eq!(decode(&mut f)?, tag_pcm(2));
        assert_eq!(f.state.input_read_offset(), 4032);

        // Loop end reached: the second frame plays again.
        assert_eq!(decode(&mut f)?, tag_pcm(2));
        assert_eq!(f.state.loop_params().loop_count, 0);
        assert_eq!(f.state.input_read_offset(), 4032);

        assert_eq!(decode(&mut f)?, tag_pcm(3));
        assert!(f.state.is_idle());

        Ok(())
    }

    #[test]
    fn rewind_moves_write_cursor() -> anyhow::Result<()> {
        let mut f = Fixture::stereo()?;
        f.submit(&stream(&[(3000, 7)])?)?;
        f.state.decode_frame(&mut TagCodec)?;
        f.drain()?;
        assert_eq!(f.state.output_write_block(), 8);

        assert!(f.state.rewind_decode_position(64)?);
        assert_eq!(f.state.output_write_block(), 7);

        assert!(f.state.rewind_decode_position(10 * 64)?);
        assert_eq!(f.state.output_write_block(), 13);

        assert!(!f.state.rewind_decode_position(16 * 64)?);
        assert_eq!(f.state.output_write_block(), f.state.output_read_block());

        Ok(())
    }

    #[test]
    fn mono_step_never_overruns_free_space() -> anyhow::Result<()> {
        let mut f = Fixture::new(SessionConfig {
            channel_count: 1,
            output_buffer_size: 0x300,
            subframes: 4,
            ..Default::default()
        })?;
        f.submit(&stream(&[(1000, 1), (1000, 2)])?)?;

        let mut codec = TagCodec;
        assert!(f.state.begin_batch());
        f.state.decode_frame(&mut codec)?;
        assert_eq!(f.state.consume_step()?, 4);
        assert_eq!(f.state.consume_step()?, 0);
        f.state.decode_frame(&mut codec)?;
        // Two blocks left before the read cursor.
        assert_eq!(f.state.consume_step()?, 2);
        assert_eq!(f.state.consume_step()?, 0);
        assert_eq!(f.state.remaining_subframes(), 2);

        Ok(())
    }

    #[test]
    fn submission_errors_leave_state_alone() -> anyhow::Result<()> {
        let mut f = Fixture::stereo()?;
        let packet = stream(&[(500, 1)])?;
        let handle = f.memory.store(&packet)?;

        assert_eq!(f.state.submit(0, 2048), Err(PlaybackError::NullBuffer));
        assert_eq!(f.state.submit(handle, 2047), Err(PlaybackError::EmptyBuffer(2047)));

        f.state.locked = false;
        assert_eq!(f.state.submit(handle, 2048), Err(PlaybackError::NotLocked));
        assert_eq!(PlaybackError::NotLocked.status(), 1);
        assert!(f.state.is_idle());

        f.state.locked = true;
        f.state.submit(handle, 2048)?;
        f.state.flush()?;
        assert!(f.state.is_idle());
        assert_eq!(f.state.input_read_offset(), BITS_PER_PACKET_HEADER);

        Ok(())
    }
}
