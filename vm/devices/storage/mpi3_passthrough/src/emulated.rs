// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A [`HostDmaAllocator`] backed by ordinary process memory, with fabricated
//! bus addresses. Used to drive the passthrough engine against a software
//! model of the controller.

use crate::dma::DmaTarget;
use crate::dma::HostDmaAllocator;
use crate::dma::MemoryBlock;
use anyhow::Context;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("emulated dma allocation of {len:#x} bytes failed")]
struct AllocationFailed {
    len: usize,
}

#[derive(Debug, Error)]
#[error("bus address range {address:#x}+{len:#x} is not backed by a live allocation")]
pub struct UnmappedAddress {
    address: u64,
    len: usize,
}

/// Hands out zeroed, contiguous buffers at increasing bus addresses.
#[derive(Clone)]
pub struct EmulatedDmaAllocator {
    inner: Arc<Mutex<EmulatedMemory>>,
}

struct EmulatedMemory {
    next_address: u64,
    alignment: u64,
    placement_offset: u64,
    allocations: usize,
    fail_at: Option<usize>,
    regions: Vec<Region>,
}

struct Region {
    address: u64,
    len: usize,
    data: Arc<Mutex<Vec<u8>>>,
}

impl Region {
    fn contains(&self, address: u64, len: usize) -> bool {
        address >= self.address && address - self.address + len as u64 <= self.len as u64
    }
}

impl EmulatedDmaAllocator {
    /// Creates an allocator whose first buffer starts at `base`.
    pub fn new(base: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EmulatedMemory {
                next_address: base,
                alignment: 4096,
                placement_offset: 0,
                allocations: 0,
                fail_at: None,
                regions: Vec::new(),
            })),
        }
    }

    /// Aligns every buffer to `alignment` bytes, which must be a power of two.
    pub fn with_alignment(self, alignment: u64) -> Self {
        assert!(alignment.is_power_of_two());
        self.inner.lock().alignment = alignment;
        self
    }

    /// Places every buffer `offset` bytes past its aligned address.
    pub fn with_placement_offset(self, offset: u64) -> Self {
        self.inner.lock().placement_offset = offset;
        self
    }

    /// Places the next buffer at or after `address`.
    pub fn set_next_address(&self, address: u64) {
        self.inner.lock().next_address = address;
    }

    /// Makes the allocation `n` requests from now fail (0 is the next one).
    pub fn fail_allocation(&self, n: usize) {
        let mut inner = self.inner.lock();
        inner.fail_at = Some(inner.allocations + n);
    }

    /// The number of buffers currently allocated.
    pub fn live_allocations(&self) -> usize {
        self.inner.lock().regions.len()
    }

    /// The number of bytes currently allocated.
    pub fn live_bytes(&self) -> usize {
        self.inner.lock().regions.iter().map(|r| r.len).sum()
    }

    /// The total number of allocation requests made so far.
    pub fn allocation_count(&self) -> usize {
        self.inner.lock().allocations
    }

    /// Reads device-visible memory by bus address, as the controller would.
    pub fn read_physical(&self, address: u64, data: &mut [u8]) -> Result<(), UnmappedAddress> {
        let region = self.find(address, data.len())?;
        let offset = (address - region.0) as usize;
        data.copy_from_slice(&region.1.lock()[offset..][..data.len()]);
        Ok(())
    }

    /// Writes device-visible memory by bus address, as the controller would.
    pub fn write_physical(&self, address: u64, data: &[u8]) -> Result<(), UnmappedAddress> {
        let region = self.find(address, data.len())?;
        let offset = (address - region.0) as usize;
        region.1.lock()[offset..][..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn find(
        &self,
        address: u64,
        len: usize,
    ) -> Result<(u64, Arc<Mutex<Vec<u8>>>), UnmappedAddress> {
        self.inner
            .lock()
            .regions
            .iter()
            .find(|r| r.contains(address, len))
            .map(|r| (r.address, r.data.clone()))
            .ok_or(UnmappedAddress { address, len })
    }
}

impl HostDmaAllocator for EmulatedDmaAllocator {
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock> {
        let mut inner = self.inner.lock();
        let index = inner.allocations;
        inner.allocations += 1;
        if inner.fail_at == Some(index) {
            inner.fail_at = None;
            return Err(AllocationFailed { len }).context("out of device-visible memory");
        }

        let mask = inner.alignment - 1;
        let address = ((inner.next_address + mask) & !mask) + inner.placement_offset;
        inner.next_address = address + len.max(1) as u64;

        let data = Arc::new(Mutex::new(vec![0; len]));
        inner.regions.push(Region {
            address,
            len,
            data: data.clone(),
        });
        tracing::trace!(address = format_args!("{:#x}", address), len, "emulated dma alloc");

        Ok(MemoryBlock::new(EmulatedDmaBuffer {
            address,
            data,
            state: self.inner.clone(),
        }))
    }
}

struct EmulatedDmaBuffer {
    address: u64,
    data: Arc<Mutex<Vec<u8>>>,
    state: Arc<Mutex<EmulatedMemory>>,
}

impl DmaTarget for EmulatedDmaBuffer {
    fn physical_address(&self) -> u64 {
        self.address
    }

    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn read_at(&self, offset: usize, data: &mut [u8]) {
        data.copy_from_slice(&self.data.lock()[offset..][..data.len()]);
    }

    fn write_at(&self, offset: usize, data: &[u8]) {
        self.data.lock()[offset..][..data.len()].copy_from_slice(data);
    }
}

impl Drop for EmulatedDmaBuffer {
    fn drop(&mut self) {
        let len = self.data.lock().len();
        let mut state = self.state.lock();
        match state
            .regions
            .iter()
            .position(|r| r.address == self.address && r.len == len)
        {
            Some(index) => {
                state.regions.swap_remove(index);
            }
            None => {
                tracing::error!(
                    address = format_args!("{:#x}", self.address),
                    len,
                    "freeing unknown emulated dma buffer"
                );
            }
        }
    }
}
