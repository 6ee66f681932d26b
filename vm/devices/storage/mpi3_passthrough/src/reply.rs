// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Copying command results back to the caller.

use crate::buffers::DataDirection;
use crate::buffers::MappedBuffers;
use crate::slot::SlotCompletion;
use crate::PassthroughError;
use mpi3_spec::ioctl::MpiReplyType;
use mpi3_spec::ioctl::ReplyBufferHeader;
use mpi3_spec::ioctl::REPLY_BUFFER_HEADER_SIZE;
use mpi3_spec::StatusReplyDescriptor;
use mpi3_spec::SENSE_BUFFER_SIZE;
use zerocopy::IntoBytes;

/// How the reply buffer describes the completion.
pub fn reply_type(completion: &SlotCompletion) -> MpiReplyType {
    if completion.reply.is_some() {
        MpiReplyType::ADDRESS
    } else {
        MpiReplyType::STATUS
    }
}

/// Builds the contents of a reply buffer: a header naming the reply type,
/// followed by either the firmware's reply frame or a status descriptor.
pub fn reply_buffer(completion: &SlotCompletion, reply_size: usize) -> Vec<u8> {
    let mut data = vec![0; REPLY_BUFFER_HEADER_SIZE + reply_size];
    let header = ReplyBufferHeader {
        mpi_reply_type: reply_type(completion),
        reserved: [0; 3],
    };
    data[..REPLY_BUFFER_HEADER_SIZE].copy_from_slice(header.as_bytes());

    let body = &mut data[REPLY_BUFFER_HEADER_SIZE..];
    match &completion.reply {
        Some(reply) => {
            let len = reply.len().min(body.len());
            body[..len].copy_from_slice(&reply[..len]);
        }
        None => {
            let status = StatusReplyDescriptor {
                ioc_status: completion.ioc_status,
                flags: 0,
                ioc_log_info: completion.ioc_loginfo,
            };
            let status = status.as_bytes();
            let len = status.len().min(body.len());
            body[..len].copy_from_slice(&status[..len]);
        }
    }
    data
}

/// Copies the reply, sense data and every inbound buffer back to the
/// caller.
///
/// Every copy is attempted even after one fails; the first failure is
/// returned.
pub(crate) fn copy_out(
    buffers: &mut MappedBuffers<'_>,
    completion: &SlotCompletion,
    reply_size: usize,
) -> Result<(), PassthroughError> {
    let mut result = Ok(());
    let mut record = |r: Result<(), crate::error::AccessError>| {
        if let Err(err) = r {
            tracing::debug!(
                error = &err as &dyn std::error::Error,
                "failed to copy results to caller"
            );
            if result.is_ok() {
                result = Err(PassthroughError::Fault(err));
            }
        }
    };

    if let Some(reply) = buffers.reply_mut() {
        if reply.caller_len != 0 {
            let data = reply_buffer(completion, reply_size);
            let len = data.len().min(reply.caller_len);
            record(reply.caller.write_at(0, &data[..len]));
        }
    }

    if let (Some(error), Some(sense)) = (buffers.error_response_mut(), &completion.sense) {
        let len = error.caller_len.min(SENSE_BUFFER_SIZE).min(sense.len());
        record(error.caller.write_at(0, &sense[..len]));
    }

    for buffer in buffers.iter_mut() {
        if buffer.role.direction() != DataDirection::FromDevice {
            continue;
        }
        let Some(mem) = &buffer.kernel else {
            continue;
        };
        let mut data = vec![0; mem.len().min(buffer.caller_len)];
        mem.read_at(0, &mut data);
        record(buffer.caller.write_at(0, &data));
    }

    result
}
