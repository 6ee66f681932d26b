// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The interface to the parts of the controller driver that live outside the
//! passthrough engine: the admin request queue, the device registry and the
//! reset state machine.

use crate::dma::HostDmaAllocator;
use mpi3_spec::PelClass;

/// Device backing for an MPI3 adapter.
pub trait ControllerBacking: 'static + Send + Sync {
    /// The allocator used for device-visible buffers.
    fn host_allocator(&self) -> &dyn HostDmaAllocator;

    /// Posts a request frame to the admin request queue. The completion is
    /// delivered later through [`crate::Adapter::complete_admin_request`],
    /// possibly before this call returns.
    fn post_admin_request(&self, frame: &[u8]) -> anyhow::Result<()>;

    /// Looks up the properties of the device with the given firmware handle.
    fn device_properties(&self, dev_handle: u16) -> Option<DeviceProperties>;

    /// Returns a snapshot of the target devices known to the driver.
    fn target_devices(&self) -> Vec<TargetDevice>;

    /// Requests a soft reset of the controller.
    fn soft_reset(&self, reason: ResetReason, snapdump: bool) -> anyhow::Result<()>;

    /// Faults the controller with a diagnostic fault and resets it.
    fn diag_fault_reset(&self, reason: ResetReason) -> anyhow::Result<()>;

    /// Posts the request that arms persistent event log notifications for the
    /// given class and locale.
    fn post_pel_seqnum_request(&self, class: PelClass, locale: u16) -> anyhow::Result<()>;
}

/// Per-device properties held by the device registry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    /// log2 of the NVMe memory page size of the device, or 0 if unknown.
    pub nvme_page_size_shift: u8,
}

impl DeviceProperties {
    /// The NVMe memory page size, if known.
    pub fn nvme_page_size(&self) -> Option<u64> {
        match self.nvme_page_size_shift {
            0 => None,
            shift @ 1..=63 => Some(1 << shift),
            _ => None,
        }
    }
}

/// A target device as tracked by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDevice {
    pub dev_handle: u16,
    pub persistent_id: u16,
    /// The host-side address of the device, if it is exposed to the host.
    pub host_address: Option<HostAddress>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HostAddress {
    pub bus_id: u8,
    pub target_id: u32,
}

/// Why the passthrough engine asked for a reset.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResetReason {
    /// A passthrough command did not complete in time.
    PassthroughTimeout,
    /// A PEL abort request did not complete in time.
    PelAbortTimeout,
    /// A management application asked for the reset.
    ManagementRequest,
}
