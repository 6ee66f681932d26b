// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Translation of a caller's buffer list into validated, device-visible
//! buffers.

use crate::dma::HostDmaAllocator;
use crate::dma::MemoryBlock;
use crate::error::AccessError;
use crate::error::InvalidRequest;
use crate::PassthroughError;
use mpi3_spec::ioctl::BufferType;
use mpi3_spec::ADMIN_REQUEST_FRAME_SIZE;
use mpi3_spec::SGE_SIZE;

/// Memory owned by the caller of a passthrough command.
pub trait CallerBuffer: Send {
    /// The declared length of the buffer.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies out of the caller buffer.
    fn read_at(&self, offset: usize, data: &mut [u8]) -> Result<(), AccessError>;

    /// Copies into the caller buffer.
    fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<(), AccessError>;
}

fn slice_range(
    len: usize,
    offset: usize,
    count: usize,
) -> Result<std::ops::Range<usize>, AccessError> {
    match offset.checked_add(count) {
        Some(end) if end <= len => Ok(offset..end),
        _ => Err(AccessError { offset, len: count }),
    }
}

impl CallerBuffer for Vec<u8> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn read_at(&self, offset: usize, data: &mut [u8]) -> Result<(), AccessError> {
        let range = slice_range(self.as_slice().len(), offset, data.len())?;
        data.copy_from_slice(&self[range]);
        Ok(())
    }

    fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<(), AccessError> {
        let range = slice_range(self.as_slice().len(), offset, data.len())?;
        self[range].copy_from_slice(data);
        Ok(())
    }
}

impl CallerBuffer for Box<[u8]> {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn read_at(&self, offset: usize, data: &mut [u8]) -> Result<(), AccessError> {
        let range = slice_range(<[u8]>::len(self), offset, data.len())?;
        data.copy_from_slice(&self[range]);
        Ok(())
    }

    fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<(), AccessError> {
        let range = slice_range(<[u8]>::len(self), offset, data.len())?;
        self[range].copy_from_slice(data);
        Ok(())
    }
}

/// One entry of the caller's buffer list.
pub struct BufferEntry<'a> {
    pub buffer_type: BufferType,
    pub buffer: &'a mut dyn CallerBuffer,
}

impl<'a> BufferEntry<'a> {
    pub fn new(buffer_type: BufferType, buffer: &'a mut dyn CallerBuffer) -> Self {
        Self {
            buffer_type,
            buffer,
        }
    }
}

/// The validated role of a buffer list entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferRole {
    /// A RAID management command, which the controller reads.
    CommandBuffer,
    /// The response to the management command.
    CommandResponse,
    /// Data transferred from the controller to the caller.
    DataIn,
    /// Data transferred from the caller to the controller.
    DataOut,
    /// Receives the firmware reply.
    ReplyFrame,
    /// Receives sense data.
    ErrorResponse,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataDirection {
    ToDevice,
    FromDevice,
    Bidirectional,
}

impl BufferRole {
    pub fn direction(&self) -> DataDirection {
        match self {
            BufferRole::CommandBuffer | BufferRole::DataOut => DataDirection::ToDevice,
            BufferRole::CommandResponse | BufferRole::DataIn => DataDirection::FromDevice,
            BufferRole::ReplyFrame | BufferRole::ErrorResponse => DataDirection::Bidirectional,
        }
    }
}

/// Tracks which roles have been seen while walking the buffer list in order.
#[derive(Default)]
struct RoleValidator {
    command: bool,
    data_in: usize,
    data_out: usize,
    reply: Option<usize>,
    error: Option<usize>,
}

impl RoleValidator {
    fn accept(
        &mut self,
        index: usize,
        buffer_type: BufferType,
    ) -> Result<BufferRole, InvalidRequest> {
        let role = match buffer_type {
            BufferType::RAIDMGMT_CMD => {
                if index != 0 {
                    return Err(InvalidRequest::CommandBufferNotFirst(index));
                }
                self.command = true;
                BufferRole::CommandBuffer
            }
            BufferType::RAIDMGMT_RESP => {
                if index != 1 || !self.command {
                    return Err(InvalidRequest::MisplacedResponseBuffer(index));
                }
                BufferRole::CommandResponse
            }
            BufferType::DATA_IN => {
                self.data_in += 1;
                if self.data_in > 1 && !self.command {
                    return Err(InvalidRequest::MultipleDataIn);
                }
                BufferRole::DataIn
            }
            BufferType::DATA_OUT => {
                self.data_out += 1;
                if self.data_out > 1 && !self.command {
                    return Err(InvalidRequest::MultipleDataOut);
                }
                BufferRole::DataOut
            }
            BufferType::MPI_REPLY => {
                if self.reply.replace(index).is_some() {
                    return Err(InvalidRequest::DuplicateBuffer(buffer_type, index));
                }
                BufferRole::ReplyFrame
            }
            BufferType::ERR_RESPONSE => {
                if self.error.replace(index).is_some() {
                    return Err(InvalidRequest::DuplicateBuffer(buffer_type, index));
                }
                BufferRole::ErrorResponse
            }
            _ => return Err(InvalidRequest::UnknownBufferType(buffer_type, index)),
        };
        Ok(role)
    }
}

/// A caller buffer paired with its device-visible copy.
pub struct MappedBuffer<'a> {
    pub(crate) role: BufferRole,
    pub(crate) caller: &'a mut dyn CallerBuffer,
    pub(crate) caller_len: usize,
    /// `None` for zero-length buffers and bookkeeping roles.
    pub(crate) kernel: Option<MemoryBlock>,
}

impl MappedBuffer<'_> {
    pub fn role(&self) -> BufferRole {
        self.role
    }

    /// The length of the device-visible buffer, including any SGE space
    /// reserved after a management command.
    pub fn kernel_len(&self) -> usize {
        self.kernel.as_ref().map_or(0, |m| m.len())
    }

    pub fn physical_address(&self) -> Option<u64> {
        self.kernel.as_ref().map(|m| m.physical_address())
    }
}

/// The validated buffer list of one passthrough command. Device-visible
/// memory is released when this is dropped.
pub struct MappedBuffers<'a> {
    buffers: Vec<MappedBuffer<'a>>,
    has_command: bool,
    has_response: bool,
    data_sges: usize,
    reply_index: Option<usize>,
    error_index: Option<usize>,
}

impl<'a> MappedBuffers<'a> {
    /// Validates `entries` against a request message of `message_len` bytes,
    /// then allocates device-visible memory and copies outbound data into it.
    ///
    /// Validation completes before anything is allocated.
    pub fn translate(
        allocator: &dyn HostDmaAllocator,
        message_len: usize,
        entries: Vec<BufferEntry<'a>>,
    ) -> Result<Self, PassthroughError> {
        if entries.is_empty() {
            return Err(PassthroughError::InvalidRequest(InvalidRequest::NoBuffers));
        }

        let mut validator = RoleValidator::default();
        let mut roles = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let role = validator
                .accept(index, entry.buffer_type)
                .map_err(PassthroughError::InvalidRequest)?;
            if u32::try_from(entry.buffer.len()).is_err() {
                return Err(PassthroughError::InvalidRequest(
                    InvalidRequest::BufferTooLarge(entry.buffer.len()),
                ));
            }
            roles.push(role);
        }

        let has_command = validator.command;
        let has_response = roles.get(1) == Some(&BufferRole::CommandResponse);
        let data_sges = validator.data_in + validator.data_out;
        if has_command {
            // The data sges are appended to the command buffer.
            let command_len = entries[0].buffer.len().saturating_add(data_sges * SGE_SIZE);
            if u32::try_from(command_len).is_err() {
                return Err(PassthroughError::InvalidRequest(
                    InvalidRequest::BufferTooLarge(command_len),
                ));
            }
        } else {
            // The data sges, or a lone terminator, follow the message.
            let frame_sges = data_sges.max(1);
            if message_len + frame_sges * SGE_SIZE > ADMIN_REQUEST_FRAME_SIZE {
                return Err(PassthroughError::InvalidRequest(InvalidRequest::SglOverflow(
                    frame_sges,
                    message_len,
                )));
            }
        }

        let mut buffers = Vec::with_capacity(entries.len());
        for (index, (entry, role)) in entries.into_iter().zip(roles).enumerate() {
            let caller_len = entry.buffer.len();
            let mut kernel_len = match role.direction() {
                DataDirection::Bidirectional => 0,
                _ => caller_len,
            };
            if has_command && index == 0 {
                kernel_len += data_sges * SGE_SIZE;
            }

            let kernel = if kernel_len != 0 {
                let mem = allocator
                    .allocate_dma_buffer(kernel_len)
                    .map_err(PassthroughError::OutOfMemory)?;
                if role.direction() == DataDirection::ToDevice && caller_len != 0 {
                    let mut data = vec![0; caller_len];
                    entry
                        .buffer
                        .read_at(0, &mut data)
                        .map_err(PassthroughError::Fault)?;
                    mem.write_at(0, &data);
                }
                Some(mem)
            } else {
                None
            };

            buffers.push(MappedBuffer {
                role,
                caller: entry.buffer,
                caller_len,
                kernel,
            });
        }

        Ok(Self {
            buffers,
            has_command,
            has_response,
            data_sges,
            reply_index: validator.reply,
            error_index: validator.error,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &MappedBuffer<'a>> {
        self.buffers.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut MappedBuffer<'a>> {
        self.buffers.iter_mut()
    }

    /// The management command buffer, if present.
    pub fn command(&self) -> Option<&MappedBuffer<'a>> {
        self.buffers.first().filter(|_| self.has_command)
    }

    /// The management response buffer, if present.
    pub fn response(&self) -> Option<&MappedBuffer<'a>> {
        self.buffers.get(1).filter(|_| self.has_response)
    }

    /// The number of data-in and data-out entries.
    pub fn data_sge_count(&self) -> usize {
        self.data_sges
    }

    /// The data buffers that need scatter-gather entries, in list order.
    pub fn data_buffers(&self) -> impl Iterator<Item = &MappedBuffer<'a>> {
        let skip = self.has_command as usize + self.has_response as usize;
        self.buffers
            .iter()
            .skip(skip)
            .filter(|b| b.role.direction() != DataDirection::Bidirectional)
    }

    pub(crate) fn reply_mut(&mut self) -> Option<&mut MappedBuffer<'a>> {
        self.reply_index.map(|i| &mut self.buffers[i])
    }

    pub(crate) fn error_response_mut(&mut self) -> Option<&mut MappedBuffer<'a>> {
        self.error_index.map(|i| &mut self.buffers[i])
    }

    pub fn wants_sense(&self) -> bool {
        self.error_index.is_some()
    }
}
