//! Guest-addressed memory shared between the caller and the decode worker.
//!
//! Buffers are referred to by 32-bit guest addresses instead of pointers.
//! Every access resolves the address again, so the decoder never holds a
//! reference into caller memory across calls.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use log::trace;

use crate::utils::errors::MemoryError;
use crate::utils::ring_buffer::RingStorage;

pub trait GuestMemory: Send + Sync {
    /// Reserves `size` bytes and returns their guest address. Never returns 0.
    fn alloc(&self, size: u32) -> Result<u32, MemoryError>;

    fn free(&self, address: u32);

    fn read(&self, address: u32, dst: &mut [u8]) -> Result<(), MemoryError>;

    fn write(&self, address: u32, src: &[u8]) -> Result<(), MemoryError>;
}

const HEAP_ALIGNMENT: u32 = 0x80;

/// Guest memory backed by one host allocation.
///
/// Allocation is a bump pointer; freed blocks are forgotten but not reused.
#[derive(Debug)]
pub struct HeapMemory {
    base: u32,
    inner: Mutex<HeapInner>,
}

#[derive(Debug)]
struct HeapInner {
    bytes: Vec<u8>,
    next: u32,
    allocations: BTreeMap<u32, u32>,
}

impl HeapMemory {
    pub const DEFAULT_BASE: u32 = 0x4000_0000;

    pub fn new(size: u32) -> Self {
        Self::with_base(Self::DEFAULT_BASE, size)
    }

    pub fn with_base(base: u32, size: u32) -> Self {
        let base = base.max(HEAP_ALIGNMENT);
        let size = size.min(u32::MAX - base);

        Self {
            base,
            inner: Mutex::new(HeapInner {
                bytes: vec![0; size as usize],
                next: 0,
                allocations: BTreeMap::new(),
            }),
        }
    }

    /// Allocates a block and fills it with `data`.
    pub fn store(&self, data: &[u8]) -> Result<u32, MemoryError> {
        let address = self.alloc(data.len() as u32)?;
        self.write(address, data)?;

        Ok(address)
    }

    /// Live allocations.
    pub fn allocation_count(&self) -> usize {
        self.lock().allocations.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HeapInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn range(&self, bytes: &[u8], address: u32, len: usize) -> Result<std::ops::Range<usize>, MemoryError> {
        let unmapped = MemoryError::Unmapped { address, len };
        let start = address.checked_sub(self.base).ok_or(unmapped.clone())? as usize;
        let end = start.checked_add(len).ok_or(unmapped.clone())?;

        if end > bytes.len() {
            return Err(unmapped);
        }

        Ok(start..end)
    }
}

impl GuestMemory for HeapMemory {
    fn alloc(&self, size: u32) -> Result<u32, MemoryError> {
        let mut inner = self.lock();
        let available = inner.bytes.len() as u32 - inner.next;
        let reserved = size.max(1).checked_next_multiple_of(HEAP_ALIGNMENT);

        let Some(reserved) = reserved.filter(|&r| r <= available) else {
            return Err(MemoryError::OutOfMemory {
                requested: size,
                available,
            });
        };

        let address = self.base + inner.next;
        inner.next += reserved;
        inner.allocations.insert(address, size);
        trace!("alloc {size} bytes at {address:#010X}");

        Ok(address)
    }

    fn free(&self, address: u32) {
        if self.lock().allocations.remove(&address).is_some() {
            trace!("free {address:#010X}");
        }
    }

    fn read(&self, address: u32, dst: &mut [u8]) -> Result<(), MemoryError> {
        let inner = self.lock();
        let range = self.range(&inner.bytes, address, dst.len())?;
        dst.copy_from_slice(&inner.bytes[range]);

        Ok(())
    }

    fn write(&self, address: u32, src: &[u8]) -> Result<(), MemoryError> {
        let mut inner = self.lock();
        let range = self.range(&inner.bytes, address, src.len())?;
        inner.bytes[range].copy_from_slice(src);

        Ok(())
    }
}

/// A fixed window of guest memory, usable as ring buffer storage.
#[derive(Clone)]
pub struct GuestRegion {
    memory: Arc<dyn GuestMemory>,
    base: u32,
    len: u32,
}

impl GuestRegion {
    pub fn new(memory: Arc<dyn GuestMemory>, base: u32, len: u32) -> Self {
        Self { memory, base, len }
    }

    fn address(&self, offset: usize, len: usize) -> io::Result<u32> {
        if offset + len > self.len as usize {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("region access {offset}+{len} beyond {} bytes", self.len),
            ));
        }

        Ok(self.base + offset as u32)
    }
}

impl std::fmt::Debug for GuestRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestRegion")
            .field("base", &format_args!("{:#010X}", self.base))
            .field("len", &self.len)
            .finish()
    }
}

impl RingStorage for GuestRegion {
    fn write_at(&mut self, offset: usize, src: &[u8]) -> io::Result<()> {
        let address = self.address(offset, src.len())?;
        self.memory.write(address, src).map_err(io::Error::other)
    }

    fn read_at(&self, offset: usize, dst: &mut [u8]) -> io::Result<()> {
        let address = self.address(offset, dst.len())?;
        self.memory.read(address, dst).map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ring_buffer::RingBuffer;

    #[test]
    fn allocations_are_disjoint_and_nonzero() -> Result<(), MemoryError> {
        let memory = HeapMemory::with_base(0, 0x1000);

        let a = memory.alloc(10)?;
        let b = memory.alloc(0x100)?;
        assert_ne!(a, 0);
        assert!(b >= a + 10);
        assert_eq!(memory.allocation_count(), 2);

        memory.write(a, &[1, 2, 3])?;
        memory.write(b, &[9; 0x100])?;

        let mut out = [0; 3];
        memory.read(a, &mut out)?;
        assert_eq!(out, [1, 2, 3]);

        memory.free(a);
        assert_eq!(memory.allocation_count(), 1);

        Ok(())
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let memory = HeapMemory::new(0x100);

        assert!(matches!(
            memory.alloc(0x200),
            Err(MemoryError::OutOfMemory { .. })
        ));
        assert!(memory.read(0x10, &mut [0; 4]).is_err());
        assert!(memory.write(HeapMemory::DEFAULT_BASE + 0xFE, &[0; 4]).is_err());
    }

    #[test]
    fn ring_over_guest_region_wraps() -> anyhow::Result<()> {
        let memory = Arc::new(HeapMemory::new(0x1000));
        let base = memory.alloc(16)?;
        let region = GuestRegion::new(memory.clone(), base, 16);

        let mut ring = RingBuffer::new(region, 16);
        ring.set_write_offset(12);
        ring.write(&[7; 8])?;
        assert_eq!(ring.write_offset(), 4);

        let mut raw = [0; 16];
        memory.read(base, &mut raw)?;
        assert_eq!(&raw[..4], &[7; 4]);
        assert_eq!(&raw[12..], &[7; 4]);
        assert_eq!(&raw[4..12], &[0; 8]);

        Ok(())
    }
}
