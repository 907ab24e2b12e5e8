//! Fixed-capacity circular byte buffer for decoded PCM.
//!
//! The bytes themselves live in a [`RingStorage`], which is either an owned
//! `Vec<u8>` or a region of guest memory that is re-resolved on every access.
//! The buffer only tracks cursors; it never protects against overwriting
//! unread data, callers bound their writes with [`RingBuffer::write_count`].

use std::io;

/// Backing store addressed by byte offset.
pub trait RingStorage {
    fn write_at(&mut self, offset: usize, src: &[u8]) -> io::Result<()>;
    fn read_at(&self, offset: usize, dst: &mut [u8]) -> io::Result<()>;
}

impl RingStorage for Vec<u8> {
    fn write_at(&mut self, offset: usize, src: &[u8]) -> io::Result<()> {
        let dst = self
            .get_mut(offset..offset + src.len())
            .ok_or_else(|| out_of_range(offset, src.len()))?;
        dst.copy_from_slice(src);

        Ok(())
    }

    fn read_at(&self, offset: usize, dst: &mut [u8]) -> io::Result<()> {
        let src = self
            .get(offset..offset + dst.len())
            .ok_or_else(|| out_of_range(offset, dst.len()))?;
        dst.copy_from_slice(src);

        Ok(())
    }
}

fn out_of_range(offset: usize, len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("ring storage access {offset}..{} out of range", offset + len),
    )
}

#[derive(Debug)]
pub struct RingBuffer<S: RingStorage> {
    storage: S,
    capacity: u32,
    read_offset: u32,
    write_offset: u32,
}

impl<S: RingStorage> RingBuffer<S> {
    pub fn new(storage: S, capacity: u32) -> Self {
        Self {
            storage,
            capacity,
            read_offset: 0,
            write_offset: 0,
        }
    }

    #[inline(always)]
    fn wrap(&self, offset: u64) -> u32 {
        if self.capacity == 0 {
            0
        } else {
            (offset % self.capacity as u64) as u32
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn empty(&self) -> bool {
        self.read_offset == self.write_offset
    }

    pub fn read_offset(&self) -> u32 {
        self.read_offset
    }

    pub fn set_read_offset(&mut self, offset: usize) {
        self.read_offset = self.wrap(offset as u64);
    }

    pub fn write_offset(&self) -> u32 {
        self.write_offset
    }

    pub fn set_write_offset(&mut self, offset: usize) {
        self.write_offset = self.wrap(offset as u64);
    }

    /// Bytes that can be written before the write cursor reaches the read cursor.
    ///
    /// Equal cursors mean an empty, fully writable buffer.
    pub fn write_count(&self) -> u32 {
        if self.read_offset == self.write_offset {
            self.capacity
        } else if self.write_offset < self.read_offset {
            self.read_offset - self.write_offset
        } else {
            (self.capacity - self.write_offset) + self.read_offset
        }
    }

    pub fn advance_read(&mut self, count: usize) {
        self.read_offset = self.wrap(self.read_offset as u64 + count as u64);
    }

    pub fn advance_write(&mut self, count: usize) {
        self.write_offset = self.wrap(self.write_offset as u64 + count as u64);
    }

    /// Writes up to `capacity` bytes from `src`, wrapping at the end.
    pub fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        let count = src.len().min(self.capacity as usize);
        if count == 0 {
            return Ok(0);
        }

        let start = self.write_offset as usize;
        let left = (self.capacity as usize - start).min(count);

        self.storage.write_at(start, &src[..left])?;
        if left < count {
            self.storage.write_at(0, &src[left..count])?;
        }

        self.advance_write(count);
        Ok(count)
    }

    /// Reads up to `capacity` bytes into `dst`, wrapping at the end.
    pub fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let count = dst.len().min(self.capacity as usize);
        if count == 0 {
            return Ok(0);
        }

        let start = self.read_offset as usize;
        let left = (self.capacity as usize - start).min(count);

        self.storage.read_at(start, &mut dst[..left])?;
        if left < count {
            self.storage.read_at(0, &mut dst[left..count])?;
        }

        self.advance_read(count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(capacity: u32) -> RingBuffer<Vec<u8>> {
        RingBuffer::new(vec![0; capacity as usize], capacity)
    }

    #[test]
    fn empty_ring_is_fully_writable() {
        let rb = ring(64);
        assert!(rb.empty());
        assert_eq!(rb.write_count(), 64);
    }

    #[test]
    fn round_trip_preserves_bytes() -> io::Result<()> {
        for n in [1usize, 17, 63, 64] {
            let mut rb = ring(64);
            rb.set_read_offset(40);
            rb.set_write_offset(40);

            let src = (0..n).map(|i| (i * 7 + 3) as u8).collect::<Vec<_>>();
            let before = rb.write_count();
            assert_eq!(rb.write(&src)?, n);

            if n < 64 {
                assert_eq!(rb.write_count(), before - n as u32);
            } else {
                // A full ring has equal cursors again.
                assert!(rb.empty());
            }

            let mut dst = vec![0; n];
            assert_eq!(rb.read(&mut dst)?, n);
            assert_eq!(dst, src);
            assert!(rb.empty());
        }

        Ok(())
    }

    #[test]
    fn write_count_follows_cursor_distance() {
        let mut rb = ring(32);

        rb.set_write_offset(10);
        assert_eq!(rb.write_count(), 32 - 10);

        rb.set_read_offset(20);
        assert_eq!(rb.write_count(), 10);

        rb.set_write_offset(20);
        assert_eq!(rb.write_count(), 32);
    }

    #[test]
    fn offsets_wrap_modulo_capacity() {
        let mut rb = ring(16);

        rb.set_read_offset(35);
        assert_eq!(rb.read_offset(), 3);

        rb.set_write_offset(15);
        rb.advance_write(3);
        assert_eq!(rb.write_offset(), 2);
    }

    #[test]
    fn write_is_clamped_to_capacity() -> io::Result<()> {
        let mut rb = ring(8);
        assert_eq!(rb.write(&[1; 20])?, 8);
        assert_eq!(rb.write_offset(), 0);

        Ok(())
    }
}
