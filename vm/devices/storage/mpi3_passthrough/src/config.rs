// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Adapter configuration supplied when an [`Adapter`](crate::Adapter) is
//! created.

use crate::error::DescriptorEntry;
use crate::PassthroughError;
use mpi3_spec::ADMIN_REQUEST_FRAME_SIZE;
use std::time::Duration;

/// Values negotiated with the firmware during IOC initialization.
#[derive(Debug, Clone)]
pub struct IocFacts {
    /// Size of a firmware reply frame, in bytes.
    pub reply_frame_size: usize,
    pub sge_modifier_mask: u8,
    pub sge_modifier_value: u8,
    pub sge_modifier_shift: u8,
}

impl Default for IocFacts {
    fn default() -> Self {
        Self {
            reply_frame_size: ADMIN_REQUEST_FRAME_SIZE,
            sge_modifier_mask: 0,
            sge_modifier_value: 0,
            sge_modifier_shift: 0,
        }
    }
}

impl IocFacts {
    pub fn sge_modifier(&self) -> SgeModifier {
        SgeModifier::new(
            self.sge_modifier_mask,
            self.sge_modifier_value,
            self.sge_modifier_shift,
        )
    }
}

/// The high address bits the controller reserves for routing information.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SgeModifier {
    mask: u64,
    value: u64,
}

impl SgeModifier {
    pub fn new(mask: u8, value: u8, shift: u8) -> Self {
        let place = |v: u8| {
            u64::from(v)
                .checked_shl(u32::from(shift) + 32)
                .unwrap_or(0)
        };
        Self {
            mask: place(mask),
            value: place(value),
        }
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    /// Stamps the modifier onto `address`, failing if the address already
    /// uses any of the reserved bits.
    pub fn apply(&self, address: u64, entry: DescriptorEntry) -> Result<u64, PassthroughError> {
        if address & self.mask != 0 {
            tracing::debug!(
                %entry,
                address = format_args!("{:#x}", address),
                mask = format_args!("{:#x}", self.mask),
                "address collides with sge modifier"
            );
            return Err(PassthroughError::AddressCollision { entry });
        }
        Ok((address & !self.mask) | self.value)
    }
}

/// Identity strings reported through the adapter info command.
#[derive(Debug, Clone)]
pub struct DriverInfo {
    pub os_name: String,
    pub os_version: String,
    pub driver_name: String,
    pub driver_version: String,
    pub driver_release_date: String,
    pub driver_capabilities: u32,
}

impl Default for DriverInfo {
    fn default() -> Self {
        Self {
            os_name: "Linux".into(),
            os_version: String::new(),
            driver_name: "mpi3mr".into(),
            driver_version: env!("CARGO_PKG_VERSION").into(),
            driver_release_date: String::new(),
            driver_capabilities: 0,
        }
    }
}

/// PCI identity of the adapter.
#[derive(Debug, Clone, Default)]
pub struct PciIdentity {
    pub device_id: u16,
    pub vendor_id: u16,
    pub subsystem_device_id: u16,
    pub subsystem_vendor_id: u16,
    pub revision_id: u8,
    pub segment: u32,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

/// Per-adapter configuration.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub facts: IocFacts,
    /// Caller timeouts are raised to at least this value.
    pub min_command_timeout: Duration,
    /// Timeout for requests the engine issues on its own behalf.
    pub internal_command_timeout: Duration,
    pub driver_info: DriverInfo,
    pub pci: PciIdentity,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            facts: IocFacts::default(),
            min_command_timeout: Duration::from_secs(
                mpi3_spec::ioctl::IOCTL_DEFAULT_TIMEOUT_SECS.into(),
            ),
            internal_command_timeout: Duration::from_secs(
                mpi3_spec::ioctl::INTERNAL_ADMIN_TIMEOUT_SECS.into(),
            ),
            driver_info: DriverInfo::default(),
            pci: PciIdentity::default(),
        }
    }
}
