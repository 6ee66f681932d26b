// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits and types for sharing host memory with the controller.

use std::sync::Arc;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// A physically contiguous buffer that both the host and the controller can
/// access.
pub trait DmaTarget: Send + Sync {
    /// The bus address the controller uses for the first byte.
    fn physical_address(&self) -> u64;

    /// The length of the buffer in bytes.
    fn len(&self) -> usize;

    /// Copies `data.len()` bytes starting at `offset` into `data`.
    fn read_at(&self, offset: usize, data: &mut [u8]);

    /// Copies `data` into the buffer starting at `offset`.
    fn write_at(&self, offset: usize, data: &[u8]);
}

/// Allocator for device-visible memory.
pub trait HostDmaAllocator: Send + Sync {
    /// Allocates a zeroed, physically contiguous buffer of `len` bytes.
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock>;
}

/// A handle to a DMA buffer, or to a window of one.
///
/// The underlying memory is released when the last handle referring to it is
/// dropped.
#[derive(Clone)]
pub struct MemoryBlock {
    mem: Arc<dyn DmaTarget>,
    offset: usize,
    len: usize,
}

impl std::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("physical_address", &format_args!("{:#x}", self.physical_address()))
            .field("len", &self.len)
            .finish()
    }
}

impl MemoryBlock {
    /// Creates a new memory block backed by `mem`.
    pub fn new<T: 'static + DmaTarget>(mem: T) -> Self {
        let len = mem.len();
        Self {
            mem: Arc::new(mem),
            offset: 0,
            len,
        }
    }

    /// Returns a view of a subset of the buffer.
    pub fn subblock(&self, offset: usize, len: usize) -> Self {
        assert!(offset <= self.len && self.len - offset >= len);
        Self {
            mem: self.mem.clone(),
            offset: self.offset + offset,
            len,
        }
    }

    /// Gets the length of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Gets the bus address of the first byte of this view.
    pub fn physical_address(&self) -> u64 {
        self.mem.physical_address() + self.offset as u64
    }

    /// Reads from the buffer into `data`.
    pub fn read_at(&self, offset: usize, data: &mut [u8]) {
        assert!(offset <= self.len && self.len - offset >= data.len());
        self.mem.read_at(self.offset + offset, data);
    }

    /// Writes into the buffer from `data`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        assert!(offset <= self.len && self.len - offset >= data.len());
        self.mem.write_at(self.offset + offset, data);
    }

    /// Reads an object from the buffer at `offset`.
    pub fn read_obj<T: FromBytes + IntoBytes + Immutable + KnownLayout>(
        &self,
        offset: usize,
    ) -> T {
        let mut obj = T::new_zeroed();
        self.read_at(offset, obj.as_mut_bytes());
        obj
    }

    /// Writes an object into the buffer at `offset`.
    pub fn write_obj<T: IntoBytes + Immutable + KnownLayout>(&self, offset: usize, data: &T) {
        self.write_at(offset, data.as_bytes());
    }

    /// Reads the whole view into a vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut data = vec![0; self.len];
        self.read_at(0, &mut data);
        data
    }
}
