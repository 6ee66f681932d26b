// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Single-command slots for requests the engine posts to the admin queue.
//!
//! A slot is occupied by one caller from acquisition until its
//! [`SlotGuard`] is dropped. The completion path only ever touches the
//! slot's result fields, under a separate lock that is never held across
//! the wait.

use crate::error::BusyReason;
use crate::frame::RequestFrame;
use crate::PassthroughError;
use mpi3_spec::HostTag;
use mpi3_spec::IOC_STATUS_LOG_INFO_AVAILABLE;
use mpi3_spec::IOC_STATUS_MASK;
use mpi3_spec::SENSE_BUFFER_SIZE;
use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

/// How long a blocking acquisition waits before rechecking its interrupt.
const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A flag a caller raises to abandon a blocking slot acquisition.
#[derive(Debug, Default)]
pub struct Interrupt(AtomicBool);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How to behave when the slot is already occupied.
#[derive(Debug, Copy, Clone)]
pub enum LockMode<'a> {
    /// Fail with [`BusyReason::SlotInUse`].
    NonBlocking,
    /// Wait for the slot until `interrupt` is raised.
    Blocking(&'a Interrupt),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Pending,
    Complete,
    TimedOut,
    Aborted,
}

/// A completion delivered by the admin reply queue.
#[derive(Debug, Copy, Clone)]
pub struct AdminCompletion<'a> {
    /// The raw status field, including the log-info-available bit.
    pub ioc_status: u16,
    pub ioc_loginfo: u32,
    /// The full reply frame, when the firmware returned one.
    pub reply: Option<&'a [u8]>,
    /// Sense data, when the firmware returned any.
    pub sense: Option<&'a [u8]>,
}

/// What a slot recorded for a completed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotCompletion {
    pub ioc_status: u16,
    pub ioc_loginfo: u32,
    /// The reply frame, padded to the negotiated reply size.
    pub reply: Option<Vec<u8>>,
    pub sense: Option<Vec<u8>>,
}

#[derive(Debug)]
pub enum SlotOutcome {
    Completed(SlotCompletion),
    TimedOut,
    Aborted,
}

struct SlotInner {
    state: SlotState,
    is_waiting: bool,
    ioc_status: u16,
    ioc_loginfo: u32,
    reply: Vec<u8>,
    reply_valid: bool,
    sense: Option<Vec<u8>>,
    is_sense: bool,
}

impl SlotInner {
    fn clear(&mut self) {
        self.state = SlotState::Idle;
        self.is_waiting = false;
        self.ioc_status = 0;
        self.ioc_loginfo = 0;
        self.reply.fill(0);
        self.reply_valid = false;
        self.sense = None;
        self.is_sense = false;
    }
}

/// A command slot identified by the host tag its requests carry.
pub struct CommandSlot {
    host_tag: HostTag,
    lock: Mutex<()>,
    inner: Mutex<SlotInner>,
    done: Condvar,
}

impl std::fmt::Debug for CommandSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSlot")
            .field("host_tag", &self.host_tag)
            .field("state", &self.state())
            .finish()
    }
}

impl CommandSlot {
    pub fn new(host_tag: HostTag, reply_size: usize) -> Self {
        Self {
            host_tag,
            lock: Mutex::new(()),
            inner: Mutex::new(SlotInner {
                state: SlotState::Idle,
                is_waiting: false,
                ioc_status: 0,
                ioc_loginfo: 0,
                reply: vec![0; reply_size],
                reply_valid: false,
                sense: None,
                is_sense: false,
            }),
            done: Condvar::new(),
        }
    }

    pub fn host_tag(&self) -> HostTag {
        self.host_tag
    }

    pub fn state(&self) -> SlotState {
        self.inner.lock().state
    }

    /// Takes exclusive ownership of the slot.
    pub fn acquire(&self, mode: LockMode<'_>) -> Result<SlotGuard<'_>, PassthroughError> {
        let lock = match mode {
            LockMode::NonBlocking => self
                .lock
                .try_lock()
                .ok_or(PassthroughError::Busy(BusyReason::SlotInUse))?,
            LockMode::Blocking(interrupt) => loop {
                if interrupt.is_raised() {
                    return Err(PassthroughError::Interrupted);
                }
                if let Some(lock) = self.lock.try_lock_for(INTERRUPT_POLL_INTERVAL) {
                    break lock;
                }
            },
        };
        Ok(SlotGuard {
            slot: self,
            _lock: lock,
        })
    }

    /// Records a completion for this slot's outstanding command and wakes
    /// the waiter. Returns false if no command was waiting for one.
    pub fn complete(&self, completion: &AdminCompletion<'_>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SlotState::Pending || !inner.is_waiting {
            tracing::warn!(
                host_tag = ?self.host_tag,
                state = ?inner.state,
                "dropping completion for a command that is not pending"
            );
            return false;
        }

        inner.ioc_status = completion.ioc_status & IOC_STATUS_MASK;
        inner.ioc_loginfo = if completion.ioc_status & IOC_STATUS_LOG_INFO_AVAILABLE != 0 {
            completion.ioc_loginfo
        } else {
            0
        };
        if let Some(reply) = completion.reply {
            let len = reply.len().min(inner.reply.len());
            inner.reply[..len].copy_from_slice(&reply[..len]);
            inner.reply_valid = true;
        }
        if let Some(sense) = completion.sense {
            if let Some(buffer) = inner.sense.as_mut() {
                let len = sense.len().min(buffer.len());
                buffer[..len].copy_from_slice(&sense[..len]);
                inner.is_sense = true;
            }
        }
        inner.state = SlotState::Complete;
        inner.is_waiting = false;
        self.done.notify_all();
        true
    }

    /// Fails the outstanding command, if any, and wakes its waiter.
    pub fn abort(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SlotState::Pending {
            return false;
        }
        inner.state = SlotState::Aborted;
        inner.is_waiting = false;
        self.done.notify_all();
        true
    }
}

/// Exclusive ownership of a [`CommandSlot`]. Dropping it returns the slot to
/// [`SlotState::Idle`].
pub struct SlotGuard<'a> {
    slot: &'a CommandSlot,
    _lock: MutexGuard<'a, ()>,
}

impl SlotGuard<'_> {
    /// Stamps `frame` with the slot's host tag and posts it with `post`.
    pub fn submit(
        &mut self,
        frame: &mut RequestFrame,
        want_sense: bool,
        post: impl FnOnce(&[u8]) -> anyhow::Result<()>,
    ) -> Result<(), PassthroughError> {
        {
            let mut inner = self.slot.inner.lock();
            inner.clear();
            inner.state = SlotState::Pending;
            inner.is_waiting = true;
            if want_sense {
                inner.sense = Some(vec![0; SENSE_BUFFER_SIZE]);
            }
        }
        frame.set_host_tag(self.slot.host_tag);

        if let Err(err) = post(frame.as_bytes()) {
            tracing::debug!(
                host_tag = ?self.slot.host_tag,
                error = err.as_ref() as &dyn std::error::Error,
                "admin request post failed"
            );
            self.slot.inner.lock().clear();
            return Err(PassthroughError::Busy(BusyReason::PostFailed));
        }
        Ok(())
    }

    /// Blocks until the submitted command completes or `timeout` elapses.
    pub fn wait(&mut self, timeout: Duration) -> SlotOutcome {
        let deadline = Instant::now() + timeout;
        let mut inner = self.slot.inner.lock();
        while inner.state == SlotState::Pending {
            if self.slot.done.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }

        match inner.state {
            SlotState::Complete => SlotOutcome::Completed(SlotCompletion {
                ioc_status: inner.ioc_status,
                ioc_loginfo: inner.ioc_loginfo,
                reply: inner.reply_valid.then(|| inner.reply.clone()),
                sense: if inner.is_sense {
                    inner.sense.take()
                } else {
                    None
                },
            }),
            SlotState::Aborted => SlotOutcome::Aborted,
            _ => {
                inner.state = SlotState::TimedOut;
                inner.is_waiting = false;
                SlotOutcome::TimedOut
            }
        }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot.inner.lock().clear();
    }
}
