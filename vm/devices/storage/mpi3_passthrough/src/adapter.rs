// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-adapter passthrough engine.

use crate::backing::ControllerBacking;
use crate::backing::ResetReason;
use crate::buffers::BufferEntry;
use crate::buffers::MappedBuffers;
use crate::config::AdapterConfig;
use crate::error::BusyReason;
use crate::frame::RequestFrame;
use crate::mgmt::LogDataCache;
use crate::mgmt::PelState;
use crate::nvme;
use crate::reply;
use crate::sgl;
use crate::slot::AdminCompletion;
use crate::slot::CommandSlot;
use crate::slot::LockMode;
use crate::slot::SlotGuard;
use crate::slot::SlotOutcome;
use crate::PassthroughError;
use mpi3_spec::ioctl::MpiReplyType;
use mpi3_spec::Function;
use mpi3_spec::HostTag;
use mpi3_spec::IocStatus;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// A firmware passthrough request.
pub struct MptRequest<'a> {
    /// The request message, copied into the start of the request frame.
    pub message: &'a [u8],
    /// The buffers the request transfers, in the order the caller listed
    /// them.
    pub buffers: Vec<BufferEntry<'a>>,
    /// Seconds to wait for completion. Raised to the adapter minimum.
    pub timeout_secs: u32,
}

/// The result of a passthrough request the firmware completed.
///
/// A failing `ioc_status` is reported here, not as an error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MptCompletion {
    pub ioc_status: u16,
    pub ioc_loginfo: u32,
    /// How the reply buffer, if any, was filled.
    pub reply_type: MpiReplyType,
}

/// An MPI3 adapter's management interface.
pub struct Adapter<T: ControllerBacking> {
    id: u32,
    backing: T,
    config: AdapterConfig,
    pub(crate) ioctl_slot: CommandSlot,
    pub(crate) pel_abort_slot: CommandSlot,
    reset_in_progress: AtomicBool,
    ioctls_blocked: AtomicBool,
    change_count: AtomicU16,
    pub(crate) log_data: Mutex<Option<LogDataCache>>,
    pub(crate) pel: Mutex<PelState>,
}

impl<T: ControllerBacking> std::fmt::Debug for Adapter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("id", &self.id)
            .field("ioctl_slot", &self.ioctl_slot)
            .field("reset_in_progress", &self.reset_in_progress)
            .field("ioctls_blocked", &self.ioctls_blocked)
            .finish()
    }
}

impl<T: ControllerBacking> Adapter<T> {
    pub fn new(id: u32, backing: T, config: AdapterConfig) -> Self {
        let reply_size = config.facts.reply_frame_size;
        Self {
            id,
            backing,
            ioctl_slot: CommandSlot::new(HostTag::IOCTL_CMDS, reply_size),
            pel_abort_slot: CommandSlot::new(HostTag::PEL_ABORT, reply_size),
            config,
            reset_in_progress: AtomicBool::new(false),
            ioctls_blocked: AtomicBool::new(false),
            change_count: AtomicU16::new(0),
            log_data: Mutex::new(None),
            pel: Mutex::new(PelState::default()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn backing(&self) -> &T {
        &self.backing
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn set_reset_in_progress(&self, in_progress: bool) {
        self.reset_in_progress.store(in_progress, Ordering::SeqCst);
    }

    pub fn reset_in_progress(&self) -> bool {
        self.reset_in_progress.load(Ordering::SeqCst)
    }

    pub fn set_ioctls_blocked(&self, blocked: bool) {
        self.ioctls_blocked.store(blocked, Ordering::SeqCst);
    }

    pub fn set_change_count(&self, count: u16) {
        self.change_count.store(count, Ordering::SeqCst);
    }

    pub fn change_count(&self) -> u16 {
        self.change_count.load(Ordering::SeqCst)
    }

    /// Delivers an admin queue completion to the slot that owns `host_tag`.
    /// Returns false if the completion was dropped.
    pub fn complete_admin_request(
        &self,
        host_tag: HostTag,
        completion: AdminCompletion<'_>,
    ) -> bool {
        match host_tag {
            HostTag::IOCTL_CMDS => self.ioctl_slot.complete(&completion),
            HostTag::PEL_ABORT => self.pel_abort_slot.complete(&completion),
            _ => {
                tracing::warn!(?host_tag, "completion for unknown host tag");
                false
            }
        }
    }

    /// Fails every outstanding command. Called by the reset path.
    pub fn abort_pending_commands(&self) {
        for slot in [&self.ioctl_slot, &self.pel_abort_slot] {
            if slot.abort() {
                tracing::info!(host_tag = ?slot.host_tag(), "aborted pending command");
            }
        }
    }

    /// Takes the management command slot, refusing if the adapter is being
    /// reset or management commands are blocked.
    pub(crate) fn acquire_ioctl_slot(
        &self,
        mode: LockMode<'_>,
    ) -> Result<SlotGuard<'_>, PassthroughError> {
        let guard = self.ioctl_slot.acquire(mode).inspect_err(|err| {
            tracing::debug!(
                adapter = self.id,
                error = err as &dyn std::error::Error,
                "failed to acquire command slot"
            );
        })?;
        self.check_accepting()?;
        Ok(guard)
    }

    pub(crate) fn check_accepting(&self) -> Result<(), PassthroughError> {
        if self.reset_in_progress() {
            tracing::debug!(adapter = self.id, "reset in progress");
            return Err(PassthroughError::Busy(BusyReason::ResetInProgress));
        }
        if self.ioctls_blocked.load(Ordering::SeqCst) {
            tracing::debug!(adapter = self.id, "management commands are blocked");
            return Err(PassthroughError::Busy(BusyReason::IoctlsBlocked));
        }
        Ok(())
    }

    /// Requests a soft reset after a command timed out, unless one is already
    /// underway.
    pub(crate) fn reset_after_timeout(&self, reason: ResetReason) {
        if self.reset_in_progress() {
            return;
        }
        if let Err(err) = self.backing.soft_reset(reason, true) {
            tracing::error!(
                adapter = self.id,
                ?reason,
                error = err.as_ref() as &dyn std::error::Error,
                "soft reset request failed"
            );
        }
    }

    /// Issues a firmware passthrough request and waits for it to complete.
    pub fn process_mpt_command(
        &self,
        request: MptRequest<'_>,
        mode: LockMode<'_>,
    ) -> Result<MptCompletion, PassthroughError> {
        let MptRequest {
            message,
            buffers,
            timeout_secs,
        } = request;

        let mut frame =
            RequestFrame::from_message(message).map_err(PassthroughError::InvalidRequest)?;
        let mut buffers = MappedBuffers::translate(
            self.backing.host_allocator(),
            frame.message_len(),
            buffers,
        )?;

        let is_nvme = frame.function() == Function::NVME_ENCAPSULATED;
        if !is_nvme {
            sgl::build_native_sgl(&mut frame, &buffers);
        }

        let mut slot = self.acquire_ioctl_slot(mode)?;

        // Owned until the command is finished with.
        let _prp_list = if is_nvme {
            nvme::build_data_pointer(
                &self.backing,
                self.config.facts.sge_modifier(),
                &mut frame,
                &buffers,
            )?
        } else {
            None
        };

        slot.submit(&mut frame, buffers.wants_sense(), |frame| {
            self.backing.post_admin_request(frame)
        })?;

        let timeout =
            Duration::from_secs(timeout_secs.into()).max(self.config.min_command_timeout);
        let completion = match slot.wait(timeout) {
            SlotOutcome::Completed(completion) => completion,
            SlotOutcome::TimedOut => {
                tracing::error!(
                    adapter = self.id,
                    function = ?frame.function(),
                    host_tag = ?frame.host_tag(),
                    timeout_secs = timeout.as_secs(),
                    "passthrough command timed out"
                );
                self.reset_after_timeout(ResetReason::PassthroughTimeout);
                return Err(PassthroughError::TimedOut);
            }
            SlotOutcome::Aborted => return Err(PassthroughError::Aborted),
        };

        if !IocStatus::from_raw(completion.ioc_status).is_success() {
            tracing::warn!(
                adapter = self.id,
                ioc_status = format_args!("{:#06x}", completion.ioc_status),
                ioc_loginfo = format_args!("{:#010x}", completion.ioc_loginfo),
                "passthrough command failed"
            );
        }

        reply::copy_out(&mut buffers, &completion, self.config.facts.reply_frame_size)?;

        Ok(MptCompletion {
            ioc_status: completion.ioc_status,
            ioc_loginfo: completion.ioc_loginfo,
            reply_type: reply::reply_type(&completion),
        })
    }
}
