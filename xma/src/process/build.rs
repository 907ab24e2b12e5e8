use crate::structs::packet::{
    BITS_PER_FRAME_HEADER, BITS_PER_PACKET_DATA, BITS_PER_PACKET_HEADER, BYTES_PER_PACKET,
    BYTES_PER_PACKET_DATA, FRAME_LENGTH_SENTINEL, MAX_FRAME_SIZE_IN_BITS,
};
use crate::utils::errors::PacketError;

/// Smallest frame: the length header plus the continuation bit.
pub const MIN_FRAME_SIZE_IN_BITS: u32 = BITS_PER_FRAME_HEADER + 1;

/// Packs frames into a packet stream.
///
/// Frames are laid out back to back across packet payloads, so the last
/// frame of a packet may be split into the next one. A frame never starts
/// where its first-frame offset could not be expressed in the packet header;
/// such gaps are padded with set bits, which read as the end-of-data length.
///
/// # Example
///
/// ```rust
/// use xma::process::build::PacketBuilder;
/// use xma::structs::packet::BYTES_PER_PACKET;
///
/// let mut builder = PacketBuilder::new();
/// builder.push_frame(12_000, &[0x55; 64]).unwrap();
/// builder.push_frame(12_000, &[0xAA; 64]).unwrap();
///
/// let stream = builder.build();
/// assert_eq!(stream.len(), 2 * BYTES_PER_PACKET);
/// ```
#[derive(Debug, Default, Clone)]
pub struct PacketBuilder {
    frames: Vec<PendingFrame>,
}

#[derive(Debug, Clone)]
struct PendingFrame {
    size_bits: u32,
    payload: Vec<u8>,
}

impl PacketBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a frame of `size_bits` bits.
    ///
    /// The bits between the length header and the continuation bit are taken
    /// MSB first from `payload`; missing bits are zero and extra bytes are
    /// ignored.
    pub fn push_frame(&mut self, size_bits: u32, payload: &[u8]) -> Result<(), PacketError> {
        if !(MIN_FRAME_SIZE_IN_BITS..=MAX_FRAME_SIZE_IN_BITS).contains(&size_bits)
            || size_bits == FRAME_LENGTH_SENTINEL
        {
            return Err(PacketError::InvalidFrameSize(size_bits));
        }

        self.frames.push(PendingFrame {
            size_bits,
            payload: payload.to_vec(),
        });

        Ok(())
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Payload position, in bits, where every queued frame starts.
    fn layout(&self) -> (Vec<u64>, u64) {
        let payload_bits = BITS_PER_PACKET_DATA as u64;
        let last_start = (MAX_FRAME_SIZE_IN_BITS - BITS_PER_PACKET_HEADER) as u64;

        let mut starts = Vec::with_capacity(self.frames.len());
        let mut pos = 0u64;

        for frame in &self.frames {
            if pos % payload_bits > last_start {
                pos += payload_bits - pos % payload_bits;
            }

            starts.push(pos);
            pos += frame.size_bits as u64;
        }

        (starts, pos)
    }

    pub fn build(&self) -> Vec<u8> {
        let payload_bits = BITS_PER_PACKET_DATA as u64;
        let (starts, end) = self.layout();
        let packets = end.div_ceil(payload_bits).max(1) as usize;

        let mut payload = vec![0xFF; packets * BYTES_PER_PACKET_DATA];

        for (i, frame) in self.frames.iter().enumerate() {
            let start = starts[i];
            let end = start + frame.size_bits as u64;

            put_bits(&mut payload, start, frame.size_bits as u64, BITS_PER_FRAME_HEADER);

            let body = (frame.size_bits - MIN_FRAME_SIZE_IN_BITS) as u64;
            for bit in 0..body {
                let set = frame
                    .payload
                    .get((bit >> 3) as usize)
                    .is_some_and(|byte| (byte >> (7 - (bit & 7))) & 1 == 1);
                put_bits(&mut payload, start + BITS_PER_FRAME_HEADER as u64 + bit, set as u64, 1);
            }

            let more = starts
                .get(i + 1)
                .is_some_and(|&next| next == end && next % payload_bits != 0);
            put_bits(&mut payload, end - 1, more as u64, 1);
        }

        let mut stream = Vec::with_capacity(packets * BYTES_PER_PACKET);
        for (k, chunk) in payload.chunks_exact(BYTES_PER_PACKET_DATA).enumerate() {
            let range = k as u64 * payload_bits..(k as u64 + 1) * payload_bits;
            let mut starting = starts.iter().filter(|s| range.contains(s));

            let offset = starting
                .next()
                .map_or(FRAME_LENGTH_SENTINEL, |&s| (s - range.start) as u32);
            let count = starts.iter().filter(|s| range.contains(s)).count().min(0x3F) as u32;

            let header = (count << 26) | (offset << 11);
            stream.extend_from_slice(&header.to_be_bytes());
            stream.extend_from_slice(chunk);
        }

        stream
    }
}

/// Writes the low `n` bits of `value` MSB first at bit `pos` of `buf`.
fn put_bits(buf: &mut [u8], pos: u64, value: u64, n: u32) {
    for i in 0..n as u64 {
        let bit = (value >> (n as u64 - 1 - i)) & 1;
        let at = pos + i;
        let mask = 0x80u8 >> (at & 7);

        if bit == 1 {
            buf[(at >> 3) as usize] |= mask;
        } else {
            buf[(at >> 3) as usize] &= !mask;
        }
    }
}
