//! Bit-granular cursor used by the packet and frame parsers.
//!
//! Bits are numbered most-significant-bit first inside every byte, the order
//! the packet producer writes them in. The cursor is bounded by an explicit
//! bit length that may be shorter than the backing slice; touching bits past
//! that length is an `UnexpectedEof` error.

use std::io;
use std::io::SeekFrom;

use bitstream_io::{BigEndian, BitRead, BitReader};

#[derive(Debug)]
pub struct BitCursor<'a> {
    bs: BitReader<io::Cursor<&'a [u8]>, BigEndian>,
    pos: u64,
    len: u64,
}

impl<'a> BitCursor<'a> {
    /// Creates a cursor over the first `len_bits` bits of `buf`.
    ///
    /// `len_bits` is clipped to the size of the slice.
    pub fn new(buf: &'a [u8], len_bits: u64) -> Self {
        let len = len_bits.min((buf.len() as u64) << 3);

        Self {
            bs: BitReader::new(io::Cursor::new(buf)),
            pos: 0,
            len,
        }
    }

    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self::new(buf, (buf.len() as u64) << 3)
    }

    #[inline(always)]
    pub fn offset(&self) -> u64 {
        self.pos
    }

    #[inline(always)]
    pub fn bits_remaining(&self) -> u64 {
        self.len - self.pos
    }

    #[inline(always)]
    fn ensure(&self, what: &str, n: u64) -> io::Result<()> {
        if n > self.bits_remaining() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{what}({n}): out of bounds bits at {}", self.pos),
            ));
        }

        Ok(())
    }

    /// Reads `n` bits (at most 64) without moving the cursor.
    #[inline(always)]
    pub fn peek(&mut self, n: u32) -> io::Result<u64> {
        let value = self.read(n)?;
        self.bs.seek_bits(SeekFrom::Start(self.pos - n as u64))?;
        self.pos -= n as u64;

        Ok(value)
    }

    /// Reads `n` bits (at most 64) and advances past them.
    #[inline(always)]
    pub fn read(&mut self, n: u32) -> io::Result<u64> {
        if n > 64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("read({n}): at most 64 bits per read"),
            ));
        }

        if n == 0 {
            return Ok(0);
        }

        self.ensure("read", n as u64)?;
        let value = self.bs.read_unsigned_var::<u64>(n)?;
        self.pos += n as u64;

        Ok(value)
    }

    #[inline(always)]
    pub fn read_bit(&mut self) -> io::Result<bool> {
        self.ensure("read_bit", 1)?;
        let bit = self.bs.read_bit()?;
        self.pos += 1;

        Ok(bit)
    }

    #[inline(always)]
    pub fn advance(&mut self, n: u64) -> io::Result<()> {
        self.ensure("advance", n)?;
        self.set_offset(self.pos + n)
    }

    #[inline(always)]
    pub fn set_offset(&mut self, bit: u64) -> io::Result<()> {
        if bit > self.len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("set_offset({bit}): beyond {} bits", self.len),
            ));
        }

        self.bs.seek_bits(SeekFrom::Start(bit))?;
        self.pos = bit;

        Ok(())
    }

    /// Copies `n` bits into `dst`, keeping their position inside the first byte.
    ///
    /// The first copied bit lands at bit `offset % 8` of `dst[0]`, so the
    /// destination is byte-aligned with the source. Bits of `dst` outside the
    /// copied span are left untouched. Returns the number of leading pad bits.
    pub fn copy(&mut self, dst: &mut [u8], n: u64) -> io::Result<u32> {
        self.ensure("copy", n)?;

        let pad = (self.pos & 7) as u32;
        let needed = (pad as u64 + n).div_ceil(8) as usize;
        if dst.len() < needed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("copy({n}): destination holds {} bytes, {needed} required", dst.len()),
            ));
        }

        let mut left = n;
        let mut out = 0;

        if pad != 0 && left > 0 {
            let head = (8 - pad as u64).min(left) as u32;
            let shift = 8 - pad - head;
            let bits = (self.read(head)? as u8) << shift;
            let keep = !((0xFFu8 >> pad) & (0xFFu8 << shift));

            dst[out] = (dst[out] & keep) | bits;
            left -= head as u64;
            out += 1;
        }

        let whole = (left >> 3) as usize;
        if whole > 0 {
            self.bs.read_bytes(&mut dst[out..out + whole])?;
            self.pos += (whole as u64) << 3;
            left -= (whole as u64) << 3;
            out += whole;
        }

        if left > 0 {
            let shift = 8 - left as u32;
            let bits = (self.read(left as u32)? as u8) << shift;

            dst[out] = (dst[out] & ((1u8 << shift) - 1)) | bits;
        }

        Ok(pad)
    }
}
