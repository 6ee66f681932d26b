// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Structures exchanged with management applications through the driver's
//! character device.

use crate::open_enum;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Version of the management interface reported in [`AdapterInfo`].
pub const IOCTL_VERSION: u32 = 0x06;

/// Lower bound on the timeout of a passthrough command, in seconds.
pub const IOCTL_DEFAULT_TIMEOUT_SECS: u32 = 10;

/// Timeout for commands the driver issues on its own behalf, in seconds.
pub const INTERNAL_ADMIN_TIMEOUT_SECS: u32 = 10;

/// Number of entries held by the log-data cache.
pub const LOGDATA_MAX_ENTRIES: u16 = 400;

/// Size of [`LogDataEntryHeader`].
pub const LOGDATA_ENTRY_HEADER_SIZE: usize = 4;

open_enum! {
    /// Role of one entry in a passthrough buffer list.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum BufferType: u8 {
        UNKNOWN = 0,
        RAIDMGMT_CMD = 1,
        RAIDMGMT_RESP = 2,
        DATA_IN = 3,
        DATA_OUT = 4,
        MPI_REPLY = 5,
        ERR_RESPONSE = 6,
    }
}

open_enum! {
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum MpiReplyType: u8 {
        /// The payload is a [`crate::StatusReplyDescriptor`].
        STATUS = 0,
        /// The payload is the firmware's reply frame.
        ADDRESS = 1,
    }
}

/// Header of the reply buffer returned for a passthrough command; the reply
/// payload follows.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ReplyBufferHeader {
    pub mpi_reply_type: MpiReplyType,
    pub reserved: [u8; 3],
}

pub const REPLY_BUFFER_HEADER_SIZE: usize = size_of::<ReplyBufferHeader>();

open_enum! {
    pub enum AdapterType: u32 {
        UNKNOWN = 0,
        AVGFAMILY = 1,
    }
}

open_enum! {
    pub enum ResetType: u8 {
        SOFT = 1,
        DIAG_FAULT = 2,
    }
}

/// Driver identification block, as reported to the firmware at init.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DriverInfoLayout {
    pub information_length: u32,
    pub driver_signature: [u8; 12],
    pub os_name: [u8; 16],
    pub os_version: [u8; 12],
    pub driver_name: [u8; 20],
    pub driver_version: [u8; 32],
    pub driver_release_date: [u8; 20],
    pub driver_capabilities: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct AdapterInfo {
    pub adp_type: u32,
    pub rsvd1: u32,
    pub pci_dev_id: u32,
    pub pci_dev_hw_rev: u32,
    pub pci_subsys_dev_id: u32,
    pub pci_subsys_ven_id: u32,
    pub pci_dev: u32,
    pub pci_func: u32,
    pub pci_bus: u32,
    pub rsvd2: u32,
    pub pci_seg_id: u32,
    pub ioctl_ver: u32,
    pub rsvd3: [u32; 3],
    pub driver_info: DriverInfoLayout,
}

/// One device in the all-target-info response. Ids of devices not exposed to
/// the host are all ones.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DeviceMapInfo {
    pub handle: u16,
    pub perst_id: u16,
    pub target_id: u32,
    pub bus_id: u8,
    pub rsvd: [u8; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct LogDataEnable {
    pub max_entries: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ChangeCount {
    pub change_count: u16,
    pub rsvd: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct LogDataEntryHeader {
    pub valid_entry: u8,
    pub rsvd1: u8,
    pub rsvd2: u16,
}
