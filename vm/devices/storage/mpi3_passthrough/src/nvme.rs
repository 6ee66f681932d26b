// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Data pointer construction for NVMe encapsulated requests.
//!
//! The controller forwards the embedded NVMe command to the drive as is, so
//! the data pointer must be expressed the way the command's PSDT field says:
//! either as PRP entries (with a PRP list once the transfer spans more than
//! two pages) or as a single SGL data block descriptor.

use crate::backing::ControllerBacking;
use crate::buffers::DataDirection;
use crate::buffers::MappedBuffers;
use crate::config::SgeModifier;
use crate::dma::MemoryBlock;
use crate::error::DescriptorEntry;
use crate::error::InvalidRequest;
use crate::frame::RequestFrame;
use crate::PassthroughError;
use mpi3_spec::NvmeDataFormat;
use mpi3_spec::NvmeEncapsulatedRequest;
use mpi3_spec::NvmePassthroughSge;
use mpi3_spec::NVME_CMD_PRP1_OFFSET;
use mpi3_spec::NVME_CMD_PRP2_OFFSET;
use mpi3_spec::NVME_CMD_SGL_OFFSET;
use mpi3_spec::NVME_ENCAPSULATED_COMMAND_OFFSET;
use mpi3_spec::NVME_PRP_SIZE;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrpError {
    #[error("no device with handle {0:#06x}")]
    UnknownDevice(u16),
    #[error("nvme page size of device {0:#06x} is unknown")]
    PageSizeUnknown(u16),
    #[error("prp list page at {address:#x} starts within one entry of a page boundary")]
    ListMisaligned { address: u64 },
    #[error("transfer needs more entries than a single prp list page holds")]
    ListTooSmall,
    #[error("failed to allocate the prp list page")]
    Allocation(#[source] anyhow::Error),
}

/// The PRP list page of one command. Freed on drop.
#[derive(Debug)]
pub struct PrpList {
    page: MemoryBlock,
}

impl PrpList {
    pub fn physical_address(&self) -> u64 {
        self.page.physical_address()
    }
}

/// Writes the data pointer of the NVMe command embedded in `frame`.
///
/// Returns the PRP list page when one was allocated; the caller keeps it
/// until the command completes.
pub(crate) fn build_data_pointer(
    backing: &dyn ControllerBacking,
    modifier: SgeModifier,
    frame: &mut RequestFrame,
    buffers: &MappedBuffers<'_>,
) -> Result<Option<PrpList>, PassthroughError> {
    let command_word: u16 = frame.read_obj(NVME_ENCAPSULATED_COMMAND_OFFSET);
    let format = NvmeDataFormat::from_command_word(command_word);

    // Encapsulated commands carry at most one data buffer.
    let data = buffers
        .iter()
        .find(|b| b.role().direction() != DataDirection::Bidirectional)
        .and_then(|b| b.kernel.as_ref());

    match format {
        NvmeDataFormat::PRP => {
            let Some(data) = data else {
                return Ok(None);
            };
            let header: NvmeEncapsulatedRequest = frame.read_obj(0);
            let list = allocate_prp_list(backing, header.dev_handle)?;
            write_prp_entries(
                frame,
                modifier,
                data.physical_address(),
                data.len() as u64,
                &list,
            )?;
            Ok(Some(list))
        }
        NvmeDataFormat::SGL1 | NvmeDataFormat::SGL2 => {
            if let Some(data) = data {
                write_sgl(frame, modifier, data.physical_address(), data.len() as u32)?;
            }
            Ok(None)
        }
        NvmeDataFormat(format) => Err(PassthroughError::InvalidRequest(
            InvalidRequest::NvmeDataFormat(format),
        )),
    }
}

fn allocate_prp_list(
    backing: &dyn ControllerBacking,
    dev_handle: u16,
) -> Result<PrpList, PassthroughError> {
    let properties = backing
        .device_properties(dev_handle)
        .ok_or(PassthroughError::PrpConstruction(PrpError::UnknownDevice(
            dev_handle,
        )))?;

    let page_size = properties
        .nvme_page_size()
        .and_then(|size| usize::try_from(size).ok())
        .ok_or(PassthroughError::PrpConstruction(
            PrpError::PageSizeUnknown(dev_handle),
        ))?;

    let page = backing
        .host_allocator()
        .allocate_dma_buffer(page_size)
        .map_err(|err| PassthroughError::PrpConstruction(PrpError::Allocation(err)))?;

    Ok(PrpList { page })
}

fn write_sgl(
    frame: &mut RequestFrame,
    modifier: SgeModifier,
    address: u64,
    length: u32,
) -> Result<(), PassthroughError> {
    let base_addr = modifier.apply(address, DescriptorEntry::Sgl)?;
    frame.write_obj(
        NVME_ENCAPSULATED_COMMAND_OFFSET + NVME_CMD_SGL_OFFSET,
        &NvmePassthroughSge {
            base_addr,
            length,
            reserved0c: 0,
            reserved0e: 0,
            sgl_type: 0,
        },
    );
    Ok(())
}

enum NextPrp {
    Prp1,
    Prp2,
    List,
}

/// Describes `length` bytes at `address` with PRP entries. The list page's
/// length is the device page size.
fn write_prp_entries(
    frame: &mut RequestFrame,
    modifier: SgeModifier,
    mut address: u64,
    mut length: u64,
    list: &PrpList,
) -> Result<(), PassthroughError> {
    let page_size = list.page.len() as u64;
    let page_mask = page_size - 1;
    let list_address = list.physical_address();

    if (list_address + NVME_PRP_SIZE as u64) & page_mask == 0 {
        tracing::error!(
            list_address = format_args!("{:#x}", list_address),
            page_size,
            "prp list page is not page aligned"
        );
        return Err(PassthroughError::PrpConstruction(
            PrpError::ListMisaligned {
                address: list_address,
            },
        ));
    }

    let prp1 = NVME_ENCAPSULATED_COMMAND_OFFSET + NVME_CMD_PRP1_OFFSET;
    let prp2 = NVME_ENCAPSULATED_COMMAND_OFFSET + NVME_CMD_PRP2_OFFSET;
    let mut next = NextPrp::Prp1;
    let mut index = 0;
    while length != 0 {
        let entry_address = list_address + (index * NVME_PRP_SIZE) as u64;
        if (entry_address + NVME_PRP_SIZE as u64) & page_mask == 0 && length > page_size {
            tracing::debug!(length, page_size, "single prp list page is not sufficient");
            return Err(PassthroughError::PrpConstruction(PrpError::ListTooSmall));
        }

        let entry_len = page_size - (address & page_mask);
        match next {
            NextPrp::Prp1 => {
                frame.write_obj(prp1, &modifier.apply(address, DescriptorEntry::Prp1)?);
                next = NextPrp::Prp2;
            }
            NextPrp::Prp2 if length > page_size => {
                // More than one page left: PRP2 points at the list instead.
                frame.write_obj(
                    prp2,
                    &modifier.apply(list_address, DescriptorEntry::PrpList)?,
                );
                next = NextPrp::List;
                continue;
            }
            NextPrp::Prp2 => {
                frame.write_obj(prp2, &modifier.apply(address, DescriptorEntry::Prp2)?);
                next = NextPrp::List;
            }
            NextPrp::List => {
                let entry = modifier.apply(address, DescriptorEntry::PrpListEntry(index))?;
                list.page.write_obj(index * NVME_PRP_SIZE, &entry);
                index += 1;
            }
        }

        address += entry_len;
        length = length.saturating_sub(entry_len);
    }
    Ok(())
}
