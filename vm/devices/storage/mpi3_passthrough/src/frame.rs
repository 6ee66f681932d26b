// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The fixed-size request frame posted to the admin request queue.

use crate::error::InvalidRequest;
use mpi3_spec::Function;
use mpi3_spec::HostTag;
use mpi3_spec::RequestHeader;
use mpi3_spec::ADMIN_REQUEST_FRAME_SIZE;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// An admin request frame. The caller's message occupies the start of the
/// frame; the rest is zero until descriptors are written into it.
#[derive(Clone)]
pub struct RequestFrame {
    data: [u8; ADMIN_REQUEST_FRAME_SIZE],
    message_len: usize,
}

impl std::fmt::Debug for RequestFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestFrame")
            .field("function", &self.function())
            .field("message_len", &self.message_len)
            .finish()
    }
}

impl RequestFrame {
    /// Copies a caller message into a new frame.
    pub fn from_message(message: &[u8]) -> Result<Self, InvalidRequest> {
        if message.is_empty() {
            return Err(InvalidRequest::EmptyMessage);
        }
        if message.len() % 4 != 0 {
            return Err(InvalidRequest::UnalignedMessage(message.len()));
        }
        if message.len() > ADMIN_REQUEST_FRAME_SIZE {
            return Err(InvalidRequest::MessageTooLarge(message.len()));
        }
        let mut data = [0; ADMIN_REQUEST_FRAME_SIZE];
        data[..message.len()].copy_from_slice(message);
        Ok(Self {
            data,
            message_len: message.len(),
        })
    }

    /// Builds a frame from a request structure issued by the engine itself.
    pub fn from_request<T: IntoBytes + Immutable + KnownLayout>(request: &T) -> Self {
        let bytes = request.as_bytes();
        let mut data = [0; ADMIN_REQUEST_FRAME_SIZE];
        data[..bytes.len()].copy_from_slice(bytes);
        Self {
            data,
            message_len: bytes.len(),
        }
    }

    /// The length of the caller's message in bytes.
    pub fn message_len(&self) -> usize {
        self.message_len
    }

    pub fn function(&self) -> Function {
        Function(self.data[std::mem::offset_of!(RequestHeader, function)])
    }

    pub fn set_host_tag(&mut self, tag: HostTag) {
        self.write_obj(mpi3_spec::REQUEST_HOST_TAG_OFFSET, &tag);
    }

    pub fn host_tag(&self) -> HostTag {
        self.read_obj(mpi3_spec::REQUEST_HOST_TAG_OFFSET)
    }

    pub fn read_obj<T: FromBytes + IntoBytes + Immutable + KnownLayout>(
        &self,
        offset: usize,
    ) -> T {
        let mut obj = T::new_zeroed();
        let len = obj.as_bytes().len();
        obj.as_mut_bytes()
            .copy_from_slice(&self.data[offset..][..len]);
        obj
    }

    pub fn write_obj<T: IntoBytes + Immutable + KnownLayout>(
        &mut self,
        offset: usize,
        obj: &T,
    ) {
        let bytes = obj.as_bytes();
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn as_bytes(&self) -> &[u8; ADMIN_REQUEST_FRAME_SIZE] {
        &self.data
    }
}
