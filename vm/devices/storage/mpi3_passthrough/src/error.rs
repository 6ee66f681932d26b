// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Errors returned by the passthrough engine.

use crate::nvme::PrpError;
use mpi3_spec::ioctl::BufferType;
use thiserror::Error;

/// Result codes returned to management applications.
pub mod errno {
    pub const EFAULT: i32 = 14;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const ERESTARTSYS: i32 = 512;
}

/// An error processing a passthrough or management command.
#[derive(Debug, Error)]
pub enum PassthroughError {
    #[error("invalid request")]
    InvalidRequest(#[source] InvalidRequest),
    #[error("no adapter with id {0}")]
    NoDevice(u32),
    #[error("out of device-visible memory")]
    OutOfMemory(#[source] anyhow::Error),
    #[error("{entry} address collides with the sge modifier bits")]
    AddressCollision { entry: DescriptorEntry },
    #[error("failed to build prp entries")]
    PrpConstruction(#[source] PrpError),
    #[error("command slot unavailable")]
    Busy(#[source] BusyReason),
    #[error("interrupted while waiting for the command slot")]
    Interrupted,
    #[error("command timed out")]
    TimedOut,
    #[error("command aborted by controller reset")]
    Aborted,
    #[error("failed to access caller buffer")]
    Fault(#[source] AccessError),
    #[error("persistent event log request failed with status {0:#06x}")]
    PelStatus(u16),
    #[error("controller request failed")]
    Controller(#[source] anyhow::Error),
}

impl PassthroughError {
    /// The result code reported to the caller for this error.
    pub fn errno(&self) -> i32 {
        match self {
            PassthroughError::InvalidRequest(_)
            | PassthroughError::AddressCollision { .. }
            | PassthroughError::PelStatus(_) => errno::EINVAL,
            PassthroughError::NoDevice(_) => errno::ENODEV,
            PassthroughError::OutOfMemory(_) | PassthroughError::PrpConstruction(_) => {
                errno::ENOMEM
            }
            PassthroughError::Busy(_) => errno::EAGAIN,
            PassthroughError::Interrupted => errno::ERESTARTSYS,
            PassthroughError::TimedOut
            | PassthroughError::Aborted
            | PassthroughError::Fault(_)
            | PassthroughError::Controller(_) => errno::EFAULT,
        }
    }

    /// Whether the caller should back off and retry the whole call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PassthroughError::Busy(_) | PassthroughError::Interrupted
        )
    }
}

/// A malformed request, rejected before any resources were acquired.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidRequest {
    #[error("empty buffer list")]
    NoBuffers,
    #[error("empty request message")]
    EmptyMessage,
    #[error("request message length {0} is not a multiple of 4")]
    UnalignedMessage(usize),
    #[error("request message of {0} bytes exceeds the admin frame")]
    MessageTooLarge(usize),
    #[error("unknown buffer type {0:?} at index {1}")]
    UnknownBufferType(BufferType, usize),
    #[error("management command buffer at index {0}, must be first")]
    CommandBufferNotFirst(usize),
    #[error("management response buffer at index {0} without a command buffer at index 0")]
    MisplacedResponseBuffer(usize),
    #[error("more than one data-in buffer without a management command buffer")]
    MultipleDataIn,
    #[error("more than one data-out buffer without a management command buffer")]
    MultipleDataOut,
    #[error("duplicate {0:?} buffer at index {1}")]
    DuplicateBuffer(BufferType, usize),
    #[error("{0} sges do not fit after a {1} byte message")]
    SglOverflow(usize, usize),
    #[error("buffer of {0} bytes is too large to describe")]
    BufferTooLarge(usize),
    #[error("nvme data format {0:#x} is not supported")]
    NvmeDataFormat(u8),
    #[error("invalid persistent event log class {0}")]
    PelClass(u8),
    #[error("unknown reset type {0}")]
    ResetType(u8),
    #[error("log data cache is not enabled")]
    LogDataDisabled,
    #[error("buffer of {0} bytes cannot hold a log data entry")]
    LogDataBufferTooSmall(usize),
}

/// Why a command could not take the command slot.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusyReason {
    #[error("another command owns the slot")]
    SlotInUse,
    #[error("controller reset in progress")]
    ResetInProgress,
    #[error("management commands are blocked")]
    IoctlsBlocked,
    #[error("admin request queue rejected the request")]
    PostFailed,
}

/// Which PRP/SGL field an address was being written to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DescriptorEntry {
    Sgl,
    Prp1,
    Prp2,
    PrpList,
    PrpListEntry(usize),
}

impl std::fmt::Display for DescriptorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DescriptorEntry::Sgl => f.pad("sgl"),
            DescriptorEntry::Prp1 => f.pad("prp1"),
            DescriptorEntry::Prp2 => f.pad("prp2"),
            DescriptorEntry::PrpList => f.pad("prp list pointer"),
            DescriptorEntry::PrpListEntry(n) => write!(f, "prp list entry {n}"),
        }
    }
}

/// A failure to access a caller buffer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("caller buffer access at offset {offset:#x} length {len:#x} failed")]
pub struct AccessError {
    pub offset: usize,
    pub len: usize,
}
