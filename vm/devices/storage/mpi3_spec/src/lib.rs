// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire definitions for the MPI 3.0 message interface used by the admin
//! request queue of MPI3 storage controllers, plus the layouts exchanged with
//! management applications.
//!
//! All multi-byte fields are little endian.

#![no_std]
#![forbid(unsafe_code)]

pub mod ioctl;

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Declares a `#[repr(transparent)]` newtype with named constants that can
/// hold any value of its storage type, so values read off the wire never need
/// to be validated before they can be represented.
#[macro_export]
macro_rules! open_enum {
    (
        $(#[$a:meta])*
        $v:vis enum $name:ident : $storage:ty {
            $(
                $(#[$vattr:meta])*
                $variant:ident = $value:expr,
            )*
        }
    ) => {
        #[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
        #[repr(transparent)]
        $(#[$a])*
        $v struct $name(pub $storage);

        impl $name {
            $(
                $(#[$vattr])*
                pub const $variant: $name = $name($value);
            )*
        }

        impl ::core::fmt::Debug for $name {
            fn fmt(&self, fmt: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                #![allow(unreachable_patterns)]
                let s = match *self {
                    $( Self::$variant => stringify!($variant), )*
                    _ => {
                        return ::core::fmt::Debug::fmt(&self.0, fmt);
                    }
                };
                fmt.pad(s)
            }
        }
    };
}

/// Size of every frame posted to the admin request queue.
pub const ADMIN_REQUEST_FRAME_SIZE: usize = 128;

/// Capacity of the sense buffer handed to the firmware for passthrough
/// commands.
pub const SENSE_BUFFER_SIZE: usize = 256;

open_enum! {
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum Function: u8 {
        IOC_FACTS = 0x01,
        IOC_INIT = 0x02,
        PORT_ENABLE = 0x03,
        EVENT_NOTIFICATION = 0x04,
        EVENT_ACK = 0x05,
        CI_DOWNLOAD = 0x06,
        CI_UPLOAD = 0x07,
        IO_UNIT_CONTROL = 0x08,
        PERSISTENT_EVENT_LOG = 0x09,
        MGMT_PASSTHROUGH = 0x0a,
        CONFIG = 0x10,
        SCSI_IO = 0x20,
        SCSI_TASK_MGMT = 0x21,
        SMP_PASSTHROUGH = 0x22,
        NVME_ENCAPSULATED = 0x24,
        TOOLBOX = 0x25,
    }
}

open_enum! {
    /// Host tags reserved by the driver for its internal command slots.
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum HostTag: u16 {
        INVALID = 0,
        INIT_CMDS = 1,
        IOCTL_CMDS = 2,
        PEL_ABORT = 3,
        PEL_WAIT = 4,
    }
}

/// Mask applied to `ioc_status` to strip the log-info-available bit.
pub const IOC_STATUS_MASK: u16 = 0x7fff;

/// Set in `ioc_status` when `ioc_log_info` carries data.
pub const IOC_STATUS_LOG_INFO_AVAILABLE: u16 = 0x8000;

open_enum! {
    pub enum IocStatus: u16 {
        SUCCESS = 0x0000,
        INVALID_FUNCTION = 0x0001,
        BUSY = 0x0002,
        INVALID_SGL = 0x0003,
        INTERNAL_ERROR = 0x0004,
        INSUFFICIENT_RESOURCES = 0x0006,
        INVALID_FIELD = 0x0007,
        INVALID_STATE = 0x0008,
        SCSI_DEVICE_NOT_THERE = 0x0043,
    }
}

impl IocStatus {
    /// Extracts the status from a raw `ioc_status` field.
    pub fn from_raw(raw: u16) -> Self {
        Self(raw & IOC_STATUS_MASK)
    }

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

/// Common header of every request frame.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RequestHeader {
    pub host_tag: u16,
    pub ioc_use_only02: u8,
    pub function: Function,
    pub ioc_use_only04: u16,
    pub ioc_use_only06: u8,
    pub msg_flags: u8,
    pub change_count: u16,
    pub function_dependent: u16,
}

/// Byte offset of `host_tag` within a request frame.
pub const REQUEST_HOST_TAG_OFFSET: usize = 0;

open_enum! {
    pub enum SgeElementType: u8 {
        SIMPLE = 0x0,
        BIT_BUCKET = 0x1,
        CHAIN = 0x2,
        LAST_CHAIN = 0x3,
        EXTENDED = 0xf,
    }
}

open_enum! {
    /// Data location address space.
    pub enum Dlas: u8 {
        SYSTEM = 0x0,
        IOC_UDP = 0x1,
        IOC_CTL = 0x2,
    }
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct SgeFlags {
    #[bits(2)]
    pub dlas: u8,
    pub end_of_buffer: bool,
    pub end_of_list: bool,
    #[bits(4)]
    pub element_type: u8,
}

impl SgeFlags {
    /// A simple element addressing system memory.
    pub const fn system_simple() -> Self {
        Self::new()
            .with_element_type(SgeElementType::SIMPLE.0)
            .with_dlas(Dlas::SYSTEM.0)
    }
}

/// A simple scatter-gather element describing one physically contiguous
/// region.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SimpleSge {
    pub address: u64,
    pub length: u32,
    pub reserved0c: [u8; 3],
    pub flags: SgeFlags,
}

pub const SGE_SIZE: usize = size_of::<SimpleSge>();

impl SimpleSge {
    pub fn new(address: u64, length: u32, flags: SgeFlags) -> Self {
        Self {
            address,
            length,
            reserved0c: [0; 3],
            flags,
        }
    }

    /// The terminator written when a request carries no data.
    pub fn zero_length() -> Self {
        Self::new(!0, 0, SgeFlags::system_simple().with_end_of_list(true))
    }
}

/// Management passthrough request. The command and response SGEs sit at fixed
/// offsets; any data SGEs are appended to the command buffer itself.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MgmtPassthroughRequest {
    pub header: RequestHeader,
    pub reserved0c: [u32; 5],
    pub command_sgl: SimpleSge,
    pub response_sgl: SimpleSge,
}

pub const MGMT_PASSTHROUGH_COMMAND_SGL_OFFSET: usize = 0x20;
pub const MGMT_PASSTHROUGH_RESPONSE_SGL_OFFSET: usize = 0x30;

/// Fixed part of an NVMe encapsulated request; the NVMe submission queue
/// entry follows at [`NVME_ENCAPSULATED_COMMAND_OFFSET`].
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct NvmeEncapsulatedRequest {
    pub host_tag: u16,
    pub ioc_use_only02: u8,
    pub function: Function,
    pub ioc_use_only04: u16,
    pub ioc_use_only06: u8,
    pub msg_flags: u8,
    pub change_count: u16,
    pub dev_handle: u16,
    pub encapsulated_command_length: u16,
    pub flags: u16,
    pub data_length: u32,
    pub reserved14: [u32; 3],
}

pub const NVME_ENCAPSULATED_COMMAND_OFFSET: usize = 0x20;

/// Offsets within the encapsulated NVMe command.
pub const NVME_CMD_PRP1_OFFSET: usize = 24;
pub const NVME_CMD_PRP2_OFFSET: usize = 32;
pub const NVME_CMD_SGL_OFFSET: usize = 24;

/// Width of a single PRP entry.
pub const NVME_PRP_SIZE: usize = 8;

open_enum! {
    /// PSDT field of an NVMe command: how the data pointer is described.
    pub enum NvmeDataFormat: u8 {
        PRP = 0,
        SGL1 = 1,
        SGL2 = 2,
    }
}

impl NvmeDataFormat {
    /// Decodes bits 14-15 of the first 16-bit word of an NVMe command.
    pub fn from_command_word(word: u16) -> Self {
        Self(((word & 0xc000) >> 14) as u8)
    }
}

/// Data block descriptor placed in the NVMe command for SGL-format requests.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct NvmePassthroughSge {
    pub base_addr: u64,
    pub length: u32,
    pub reserved0c: u16,
    pub reserved0e: u8,
    pub sgl_type: u8,
}

/// Reply descriptor synthesized for a completion without a full reply frame.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct StatusReplyDescriptor {
    pub ioc_status: u16,
    pub flags: u16,
    pub ioc_log_info: u32,
}

open_enum! {
    pub enum PelAction: u8 {
        GET_SEQNUM = 0x01,
        MARK_CLEAR = 0x02,
        GET_LOG = 0x03,
        GET_COUNT = 0x04,
        WAIT = 0x05,
        ABORT = 0x06,
    }
}

open_enum! {
    pub enum PelClass: u8 {
        DEBUG = 0,
        PROGRESS = 1,
        INFORMATIONAL = 2,
        WARNING = 3,
        CRITICAL = 4,
        FATAL = 5,
        FAULT = 6,
    }
}

open_enum! {
    pub enum PelStatus: u16 {
        SUCCESS = 0x0000,
        NOT_USED = 0x0001,
        ABORTED = 0x0002,
        IMAGE_NOT_FOUND = 0x0003,
    }
}

/// Persistent event log request asking the firmware to abort an outstanding
/// request (identified by host tag).
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PelAbortRequest {
    pub host_tag: u16,
    pub ioc_use_only02: u8,
    pub function: Function,
    pub ioc_use_only04: u16,
    pub ioc_use_only06: u8,
    pub msg_flags: u8,
    pub change_count: u16,
    pub reserved0a: u16,
    pub action: u8,
    pub reserved0d: u8,
    pub reserved0e: u16,
    pub abort_host_tag: u16,
    pub reserved12: u16,
    pub reserved14: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PelReply {
    pub host_tag: u16,
    pub ioc_use_only02: u8,
    pub function: Function,
    pub ioc_use_only04: u16,
    pub ioc_use_only06: u8,
    pub msg_flags: u8,
    pub ioc_use_only08: u16,
    pub ioc_status: u16,
    pub ioc_log_info: u32,
    pub action: u8,
    pub reserved11: u8,
    pub reserved12: u16,
    pub pe_log_status: u16,
    pub reserved16: u16,
    pub transfer_length: u32,
}

/// Bytes of an event notification reply that precede its event data.
pub const EVENT_NOTIFICATION_REPLY_HEADER_SIZE: usize = 24;
