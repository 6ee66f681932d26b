// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Management commands serviced by the driver itself rather than the
//! firmware.
//!
//! These share the passthrough command slot's lock, so they never run
//! concurrently with a passthrough command on the same adapter.

use crate::backing::ControllerBacking;
use crate::backing::ResetReason;
use crate::error::InvalidRequest;
use crate::frame::RequestFrame;
use crate::slot::Interrupt;
use crate::slot::LockMode;
use crate::slot::SlotOutcome;
use crate::Adapter;
use crate::PassthroughError;
use mpi3_spec::ioctl::AdapterInfo;
use mpi3_spec::ioctl::AdapterType;
use mpi3_spec::ioctl::ChangeCount;
use mpi3_spec::ioctl::DeviceMapInfo;
use mpi3_spec::ioctl::DriverInfoLayout;
use mpi3_spec::ioctl::LogDataEnable;
use mpi3_spec::ioctl::LogDataEntryHeader;
use mpi3_spec::ioctl::ResetType;
use mpi3_spec::ioctl::IOCTL_VERSION;
use mpi3_spec::ioctl::LOGDATA_ENTRY_HEADER_SIZE;
use mpi3_spec::ioctl::LOGDATA_MAX_ENTRIES;
use mpi3_spec::Function;
use mpi3_spec::HostTag;
use mpi3_spec::IocStatus;
use mpi3_spec::PelAbortRequest;
use mpi3_spec::PelAction;
use mpi3_spec::PelClass;
use mpi3_spec::PelReply;
use mpi3_spec::PelStatus;
use mpi3_spec::EVENT_NOTIFICATION_REPLY_HEADER_SIZE;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// Ring of recent event log data, filled by the event path.
pub(crate) struct LogDataCache {
    entry_size: usize,
    data: Vec<u8>,
    next: usize,
}

impl LogDataCache {
    fn new(entry_size: usize) -> Self {
        Self {
            entry_size,
            data: vec![0; entry_size * usize::from(LOGDATA_MAX_ENTRIES)],
            next: 0,
        }
    }

    fn record(&mut self, event_data: &[u8]) {
        let entry = &mut self.data[self.next * self.entry_size..][..self.entry_size];
        entry.fill(0);
        let header = LogDataEntryHeader {
            valid_entry: 1,
            rsvd1: 0,
            rsvd2: 0,
        };
        entry[..LOGDATA_ENTRY_HEADER_SIZE].copy_from_slice(header.as_bytes());
        let body = &mut entry[LOGDATA_ENTRY_HEADER_SIZE..];
        let len = event_data.len().min(body.len());
        body[..len].copy_from_slice(&event_data[..len]);
        self.next = (self.next + 1) % usize::from(LOGDATA_MAX_ENTRIES);
    }
}

/// Persistent event log notification settings.
#[derive(Debug, Copy, Clone)]
pub(crate) struct PelState {
    enabled: bool,
    class: PelClass,
    locale: u16,
}

impl Default for PelState {
    fn default() -> Self {
        Self {
            enabled: false,
            class: PelClass::DEBUG,
            locale: 0,
        }
    }
}

impl PelState {
    /// Whether the current settings already report everything `class` and
    /// `locale` ask for.
    fn covers(&self, class: PelClass, locale: u16) -> bool {
        self.enabled && self.class <= class && self.locale & locale == locale
    }
}

/// The devices known to the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllTargetInfo {
    /// The number of devices, which may exceed `entries.len()`.
    pub num_devices: u16,
    pub entries: Vec<DeviceMapInfo>,
}

fn copy_str(dest: &mut [u8], src: &str) {
    let len = src.len().min(dest.len());
    dest[..len].copy_from_slice(&src.as_bytes()[..len]);
}

impl<T: ControllerBacking> Adapter<T> {
    /// Returns the adapter's identity.
    pub fn adapter_info(&self, mode: LockMode<'_>) -> Result<AdapterInfo, PassthroughError> {
        let _slot = self.ioctl_slot.acquire(mode)?;
        let pci = &self.config().pci;
        let driver = &self.config().driver_info;

        let mut driver_info = DriverInfoLayout::new_zeroed();
        driver_info.information_length = size_of::<DriverInfoLayout>() as u32;
        copy_str(&mut driver_info.driver_signature, "Broadcom");
        copy_str(&mut driver_info.os_name, &driver.os_name);
        copy_str(&mut driver_info.os_version, &driver.os_version);
        copy_str(&mut driver_info.driver_name, &driver.driver_name);
        copy_str(&mut driver_info.driver_version, &driver.driver_version);
        copy_str(
            &mut driver_info.driver_release_date,
            &driver.driver_release_date,
        );
        driver_info.driver_capabilities = driver.driver_capabilities;

        let mut info = AdapterInfo::new_zeroed();
        info.adp_type = AdapterType::AVGFAMILY.0;
        info.pci_dev_id = pci.device_id.into();
        info.pci_dev_hw_rev = pci.revision_id.into();
        info.pci_subsys_dev_id = pci.subsystem_device_id.into();
        info.pci_subsys_ven_id = pci.subsystem_vendor_id.into();
        info.pci_dev = pci.device.into();
        info.pci_func = pci.function.into();
        info.pci_bus = pci.bus.into();
        info.pci_seg_id = pci.segment;
        info.ioctl_ver = IOCTL_VERSION;
        info.driver_info = driver_info;
        Ok(info)
    }

    /// Resets the controller on behalf of a management application.
    pub fn adapter_reset(
        &self,
        mode: LockMode<'_>,
        reset_type: ResetType,
    ) -> Result<(), PassthroughError> {
        let _slot = self.ioctl_slot.acquire(mode)?;
        let result = match reset_type {
            ResetType::SOFT => self
                .backing()
                .soft_reset(ResetReason::ManagementRequest, false),
            ResetType::DIAG_FAULT => self
                .backing()
                .diag_fault_reset(ResetReason::ManagementRequest),
            ResetType(other) => {
                tracing::debug!(reset_type = other, "unknown reset type");
                return Err(PassthroughError::InvalidRequest(
                    InvalidRequest::ResetType(other),
                ));
            }
        };
        result.map_err(PassthroughError::Controller)
    }

    /// Describes up to `max_entries` of the adapter's target devices.
    pub fn all_target_info(
        &self,
        mode: LockMode<'_>,
        max_entries: usize,
    ) -> Result<AllTargetInfo, PassthroughError> {
        let _slot = self.ioctl_slot.acquire(mode)?;
        let devices = self.backing().target_devices();
        let entries = devices
            .iter()
            .take(max_entries)
            .map(|dev| {
                let mut entry = DeviceMapInfo {
                    handle: dev.dev_handle,
                    perst_id: dev.persistent_id,
                    target_id: !0,
                    bus_id: !0,
                    rsvd: [!0; 3],
                };
                if let Some(address) = dev.host_address {
                    entry.target_id = address.target_id;
                    entry.bus_id = address.bus_id;
                }
                entry
            })
            .collect();
        Ok(AllTargetInfo {
            num_devices: devices.len().try_into().unwrap_or(u16::MAX),
            entries,
        })
    }

    /// Starts caching event log data, if it isn't already.
    pub fn enable_log_data(&self, mode: LockMode<'_>) -> Result<LogDataEnable, PassthroughError> {
        let _slot = self.ioctl_slot.acquire(mode)?;
        let mut cache = self.log_data.lock();
        if cache.is_none() {
            let entry_size = self
                .config()
                .facts
                .reply_frame_size
                .saturating_sub(EVENT_NOTIFICATION_REPLY_HEADER_SIZE)
                + LOGDATA_ENTRY_HEADER_SIZE;
            *cache = Some(LogDataCache::new(entry_size));
            tracing::info!(adapter = self.id(), entry_size, "log data cache enabled");
        }
        Ok(LogDataEnable {
            max_entries: LOGDATA_MAX_ENTRIES,
        })
    }

    /// Returns as many whole cached log entries as fit in `max_bytes`.
    pub fn get_log_data(
        &self,
        mode: LockMode<'_>,
        max_bytes: usize,
    ) -> Result<Vec<u8>, PassthroughError> {
        let _slot = self.ioctl_slot.acquire(mode)?;
        let cache = self.log_data.lock();
        let cache = cache
            .as_ref()
            .ok_or(PassthroughError::InvalidRequest(InvalidRequest::LogDataDisabled))?;
        if max_bytes < cache.entry_size {
            return Err(PassthroughError::InvalidRequest(
                InvalidRequest::LogDataBufferTooSmall(max_bytes),
            ));
        }
        let entries = (max_bytes / cache.entry_size).min(usize::from(LOGDATA_MAX_ENTRIES));
        Ok(cache.data[..entries * cache.entry_size].to_vec())
    }

    /// Caches the data of an event for management applications. Does nothing
    /// until the cache is enabled.
    pub fn record_log_data(&self, event_data: &[u8]) {
        if let Some(cache) = self.log_data.lock().as_mut() {
            cache.record(event_data);
        }
    }

    pub fn get_change_count(&self, mode: LockMode<'_>) -> Result<ChangeCount, PassthroughError> {
        let _slot = self.ioctl_slot.acquire(mode)?;
        Ok(ChangeCount {
            change_count: self.change_count(),
            rsvd: 0,
        })
    }

    /// Arms persistent event log notifications for `class` and `locale`,
    /// widening any settings already in place.
    pub fn enable_pel(
        &self,
        mode: LockMode<'_>,
        class: PelClass,
        locale: u16,
    ) -> Result<(), PassthroughError> {
        if class > PelClass::FAULT {
            tracing::debug!(class = class.0, "out of range pel class");
            return Err(PassthroughError::InvalidRequest(InvalidRequest::PelClass(
                class.0,
            )));
        }

        let _slot = self.ioctl_slot.acquire(mode)?;
        let mut pel = self.pel.lock();
        let (mut class, mut locale) = (class, locale);
        if pel.enabled {
            if pel.covers(class, locale) {
                return Ok(());
            }
            locale |= pel.locale;
            class = class.min(pel.class);
            self.abort_pel_wait()?;
        }

        let previous = *pel;
        *pel = PelState {
            enabled: true,
            class,
            locale,
        };
        if let Err(err) = self.backing().post_pel_seqnum_request(class, locale) {
            tracing::debug!(
                error = err.as_ref() as &dyn std::error::Error,
                "pel get sequence number request failed"
            );
            *pel = PelState {
                enabled: false,
                ..previous
            };
            return Err(PassthroughError::Controller(err));
        }
        Ok(())
    }

    /// Asks the firmware to abort the outstanding PEL wait request.
    fn abort_pel_wait(&self) -> Result<(), PassthroughError> {
        self.check_accepting()?;

        let never = Interrupt::new();
        let mut slot = self.pel_abort_slot.acquire(LockMode::Blocking(&never))?;
        let mut frame = RequestFrame::from_request(&PelAbortRequest {
            host_tag: HostTag::PEL_ABORT.0,
            ioc_use_only02: 0,
            function: Function::PERSISTENT_EVENT_LOG,
            ioc_use_only04: 0,
            ioc_use_only06: 0,
            msg_flags: 0,
            change_count: 0,
            reserved0a: 0,
            action: PelAction::ABORT.0,
            reserved0d: 0,
            reserved0e: 0,
            abort_host_tag: HostTag::PEL_WAIT.0,
            reserved12: 0,
            reserved14: 0,
        });
        slot.submit(&mut frame, false, |frame| {
            self.backing().post_admin_request(frame)
        })?;

        let completion = match slot.wait(self.config().internal_command_timeout) {
            SlotOutcome::Completed(completion) => completion,
            SlotOutcome::TimedOut => {
                tracing::error!(adapter = self.id(), "pel abort request timed out");
                self.reset_after_timeout(ResetReason::PelAbortTimeout);
                return Err(PassthroughError::TimedOut);
            }
            SlotOutcome::Aborted => return Err(PassthroughError::Aborted),
        };

        if !IocStatus::from_raw(completion.ioc_status).is_success() {
            tracing::debug!(
                ioc_status = format_args!("{:#06x}", completion.ioc_status),
                ioc_loginfo = format_args!("{:#010x}", completion.ioc_loginfo),
                "pel abort request failed"
            );
            return Err(PassthroughError::Controller(anyhow::anyhow!(
                "pel abort failed with ioc status {:#06x}",
                completion.ioc_status
            )));
        }

        if let Some(reply) = &completion.reply {
            if let Ok((reply, _)) = PelReply::read_from_prefix(reply) {
                let status = PelStatus(reply.pe_log_status);
                if status != PelStatus::SUCCESS {
                    tracing::debug!(pe_log_status = ?status, "pel abort request failed");
                    return Err(PassthroughError::PelStatus(status.0));
                }
            }
        }
        Ok(())
    }
}
