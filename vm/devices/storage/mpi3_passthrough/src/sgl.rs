// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Native scatter-gather list construction for passthrough requests.

use crate::buffers::MappedBuffer;
use crate::buffers::MappedBuffers;
use crate::frame::RequestFrame;
use mpi3_spec::SgeFlags;
use mpi3_spec::SimpleSge;
use mpi3_spec::MGMT_PASSTHROUGH_COMMAND_SGL_OFFSET;
use mpi3_spec::MGMT_PASSTHROUGH_RESPONSE_SGL_OFFSET;
use mpi3_spec::SGE_SIZE;

fn sge_for(buffer: &MappedBuffer<'_>, flags: SgeFlags) -> SimpleSge {
    // Device-visible lengths, including sge space reserved after a command,
    // were bounded to u32 during translation.
    SimpleSge::new(
        buffer.physical_address().unwrap_or(0),
        buffer.kernel_len() as u32,
        flags,
    )
}

/// Describes `buffers` to the firmware.
///
/// A management command buffer and its response are described at their
/// fixed slots in the frame, and the data SGEs are then appended to the
/// command buffer after the caller's command. Otherwise the data SGEs follow
/// the caller's message in the frame.
pub(crate) fn build_native_sgl(frame: &mut RequestFrame, buffers: &MappedBuffers<'_>) {
    let flags = SgeFlags::system_simple().with_end_of_buffer(true);
    let last_flags = flags.with_end_of_list(true);

    let data_sges: Vec<SimpleSge> = {
        let count = buffers.data_sge_count();
        buffers
            .data_buffers()
            .enumerate()
            .map(|(i, b)| sge_for(b, if i + 1 == count { last_flags } else { flags }))
            .collect()
    };

    if let Some(command) = buffers.command() {
        frame.write_obj(
            MGMT_PASSTHROUGH_COMMAND_SGL_OFFSET,
            &sge_for(command, last_flags),
        );
        let response = match buffers.response() {
            Some(response) => sge_for(response, last_flags),
            None => SimpleSge::zero_length(),
        };
        frame.write_obj(MGMT_PASSTHROUGH_RESPONSE_SGL_OFFSET, &response);

        if let Some(mem) = &command.kernel {
            for (i, sge) in data_sges.iter().enumerate() {
                mem.write_obj(command.caller_len + i * SGE_SIZE, sge);
            }
        }
        return;
    }

    if data_sges.is_empty() {
        frame.write_obj(frame.message_len(), &SimpleSge::zero_length());
        return;
    }
    let base = frame.message_len();
    for (i, sge) in data_sges.iter().enumerate() {
        frame.write_obj(base + i * SGE_SIZE, sge);
    }
}
