// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Management passthrough for MPI3 storage controllers.
//!
//! A management application hands the engine a firmware request message and
//! a list of buffers. The engine copies the buffers into device-visible
//! memory, describes them to the firmware (as native SGEs, or as NVMe PRP or
//! SGL entries for encapsulated NVMe commands), posts the request on the
//! admin queue, waits for the completion and copies the results back.
//!
//! Only one passthrough command is outstanding per adapter at a time.

#![forbid(unsafe_code)]

mod adapter;
mod backing;
mod buffers;
mod config;
mod dma;
pub mod emulated;
mod error;
mod frame;
mod mgmt;
mod nvme;
mod registry;
mod reply;
mod sgl;
mod slot;
#[cfg(test)]
mod test_helpers;
#[cfg(test)]
mod tests;

pub use self::adapter::Adapter;
pub use self::adapter::MptCompletion;
pub use self::adapter::MptRequest;
pub use self::backing::ControllerBacking;
pub use self::backing::DeviceProperties;
pub use self::backing::HostAddress;
pub use self::backing::ResetReason;
pub use self::backing::TargetDevice;
pub use self::buffers::BufferEntry;
pub use self::buffers::BufferRole;
pub use self::buffers::CallerBuffer;
pub use self::buffers::DataDirection;
pub use self::config::AdapterConfig;
pub use self::config::DriverInfo;
pub use self::config::IocFacts;
pub use self::config::PciIdentity;
pub use self::config::SgeModifier;
pub use self::dma::DmaTarget;
pub use self::dma::HostDmaAllocator;
pub use self::dma::MemoryBlock;
pub use self::error::errno;
pub use self::error::AccessError;
pub use self::error::BusyReason;
pub use self::error::DescriptorEntry;
pub use self::error::InvalidRequest;
pub use self::error::PassthroughError;
pub use self::mgmt::AllTargetInfo;
pub use self::nvme::PrpError;
pub use self::registry::AdapterRegistry;
pub use self::slot::AdminCompletion;
pub use self::slot::Interrupt;
pub use self::slot::LockMode;
pub use self::slot::SlotState;
