// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end tests driving the engine against a software controller.

use crate::emulated::EmulatedDmaAllocator;
use crate::errno;
use crate::Adapter;
use crate::AdapterConfig;
use crate::AdapterRegistry;
use crate::AdminCompletion;
use crate::BufferEntry;
use crate::BusyReason;
use crate::ControllerBacking;
use crate::DescriptorEntry;
use crate::DeviceProperties;
use crate::HostAddress;
use crate::HostDmaAllocator;
use crate::InvalidRequest;
use crate::Interrupt;
use crate::LockMode;
use crate::MptRequest;
use crate::PassthroughError;
use crate::PrpError;
use crate::ResetReason;
use crate::TargetDevice;
use crate::test_helpers::init_tracing;
use mpi3_spec::ioctl::BufferType;
use mpi3_spec::ioctl::MpiReplyType;
use mpi3_spec::ioctl::ResetType;
use mpi3_spec::Function;
use mpi3_spec::HostTag;
use mpi3_spec::NvmePassthroughSge;
use mpi3_spec::PelClass;
use mpi3_spec::PelReply;
use mpi3_spec::PelStatus;
use mpi3_spec::SimpleSge;
use mpi3_spec::NVME_CMD_PRP1_OFFSET;
use mpi3_spec::NVME_CMD_PRP2_OFFSET;
use mpi3_spec::NVME_CMD_SGL_OFFSET;
use mpi3_spec::NVME_ENCAPSULATED_COMMAND_OFFSET;
use mpi3_spec::SGE_SIZE;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

#[derive(Debug, Clone, Default)]
struct Response {
    ioc_status: u16,
    ioc_loginfo: u32,
    reply: Option<Vec<u8>>,
    sense: Option<Vec<u8>>,
}

impl Response {
    fn success() -> Self {
        Self::default()
    }

    fn deliver(&self, adapter: &Adapter<MockBacking>, tag: HostTag) -> bool {
        adapter.complete_admin_request(
            tag,
            AdminCompletion {
                ioc_status: self.ioc_status,
                ioc_loginfo: self.ioc_loginfo,
                reply: self.reply.as_deref(),
                sense: self.sense.as_deref(),
            },
        )
    }
}

/// What the simulated firmware does with a posted request.
enum Action {
    /// Complete from another thread shortly after the post.
    Complete(Response),
    /// Complete before the post returns.
    Inline(Response),
    /// Hold the completion until the test releases it.
    Defer(Response),
    /// Never complete.
    Ignore,
    /// Refuse the post.
    Reject,
}

/// The firmware's view of a posted request.
struct FirmwareView<'a> {
    frame: &'a [u8],
    memory: &'a EmulatedDmaAllocator,
}

impl FirmwareView<'_> {
    fn function(&self) -> Function {
        Function(self.frame[3])
    }

    fn obj<T: FromBytes>(&self, offset: usize) -> T {
        let Ok((value, _)) = T::read_from_prefix(&self.frame[offset..]) else {
            panic!("frame too short for read at {offset:#x}");
        };
        value
    }

    fn sge(&self, offset: usize) -> SimpleSge {
        self.obj(offset)
    }

    fn read(&self, address: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0; len];
        self.memory.read_physical(address, &mut data).unwrap();
        data
    }

    fn write(&self, address: u64, data: &[u8]) {
        self.memory.write_physical(address, data).unwrap();
    }
}

type Firmware = Arc<dyn Fn(&FirmwareView<'_>) -> Action + Send + Sync>;

struct MockState {
    memory: EmulatedDmaAllocator,
    adapter: Mutex<Weak<Adapter<MockBacking>>>,
    firmware: Mutex<Firmware>,
    posted: Mutex<Vec<Vec<u8>>>,
    deferred: Mutex<Vec<(HostTag, Response)>>,
    soft_resets: Mutex<Vec<(ResetReason, bool)>>,
    diag_resets: Mutex<Vec<ResetReason>>,
    devices: Mutex<HashMap<u16, DeviceProperties>>,
    targets: Mutex<Vec<TargetDevice>>,
    pel_requests: Mutex<Vec<(PelClass, u16)>>,
    fail_pel_requests: AtomicBool,
}

#[derive(Clone)]
struct MockBacking(Arc<MockState>);

impl MockBacking {
    fn new(memory: EmulatedDmaAllocator) -> Self {
        Self(Arc::new(MockState {
            memory,
            adapter: Mutex::new(Weak::new()),
            firmware: Mutex::new(Arc::new(|_: &FirmwareView<'_>| {
                Action::Complete(Response::success())
            }) as Firmware),
            posted: Default::default(),
            deferred: Default::default(),
            soft_resets: Default::default(),
            diag_resets: Default::default(),
            devices: Default::default(),
            targets: Default::default(),
            pel_requests: Default::default(),
            fail_pel_requests: AtomicBool::new(false),
        }))
    }

    fn set_firmware(&self, f: impl Fn(&FirmwareView<'_>) -> Action + Send + Sync + 'static) {
        *self.0.firmware.lock() = Arc::new(f);
    }

    fn memory(&self) -> &EmulatedDmaAllocator {
        &self.0.memory
    }

    fn posted(&self) -> Vec<Vec<u8>> {
        self.0.posted.lock().clone()
    }

    fn wait_for_posts(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.0.posted.lock().len() < count {
            assert!(Instant::now() < deadline, "request was never posted");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn complete_deferred(&self) -> usize {
        let deferred = std::mem::take(&mut *self.0.deferred.lock());
        let adapter = self.0.adapter.lock().upgrade().unwrap();
        for (tag, response) in &deferred {
            assert!(response.deliver(&adapter, *tag));
        }
        deferred.len()
    }

    fn add_device(&self, dev_handle: u16, nvme_page_size_shift: u8) {
        self.0.devices.lock().insert(
            dev_handle,
            DeviceProperties {
                nvme_page_size_shift,
            },
        );
    }
}

impl ControllerBacking for MockBacking {
    fn host_allocator(&self) -> &dyn HostDmaAllocator {
        &self.0.memory
    }

    fn post_admin_request(&self, frame: &[u8]) -> anyhow::Result<()> {
        let tag = HostTag(u16::from_le_bytes([frame[0], frame[1]]));
        let firmware = self.0.firmware.lock().clone();
        let action = firmware(&FirmwareView {
            frame,
            memory: &self.0.memory,
        });
        if matches!(action, Action::Reject) {
            anyhow::bail!("admin request queue full");
        }
        self.0.posted.lock().push(frame.to_vec());

        match action {
            Action::Complete(response) => {
                let adapter = self.0.adapter.lock().clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(5));
                    if let Some(adapter) = adapter.upgrade() {
                        response.deliver(&adapter, tag);
                    }
                });
            }
            Action::Inline(response) => {
                let adapter = self.0.adapter.lock().upgrade().unwrap();
                assert!(response.deliver(&adapter, tag));
            }
            Action::Defer(response) => self.0.deferred.lock().push((tag, response)),
            Action::Ignore | Action::Reject => {}
        }
        Ok(())
    }

    fn device_properties(&self, dev_handle: u16) -> Option<DeviceProperties> {
        self.0.devices.lock().get(&dev_handle).copied()
    }

    fn target_devices(&self) -> Vec<TargetDevice> {
        self.0.targets.lock().clone()
    }

    fn soft_reset(&self, reason: ResetReason, snapdump: bool) -> anyhow::Result<()> {
        self.0.soft_resets.lock().push((reason, snapdump));
        Ok(())
    }

    fn diag_fault_reset(&self, reason: ResetReason) -> anyhow::Result<()> {
        self.0.diag_resets.lock().push(reason);
        Ok(())
    }

    fn post_pel_seqnum_request(&self, class: PelClass, locale: u16) -> anyhow::Result<()> {
        if self.0.fail_pel_requests.load(Ordering::SeqCst) {
            anyhow::bail!("pel request rejected");
        }
        self.0.pel_requests.lock().push((class, locale));
        Ok(())
    }
}

fn test_config() -> AdapterConfig {
    AdapterConfig {
        min_command_timeout: Duration::from_millis(10),
        internal_command_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

fn new_adapter_with(
    memory: EmulatedDmaAllocator,
    config: AdapterConfig,
) -> (Arc<Adapter<MockBacking>>, MockBacking) {
    init_tracing();
    let backing = MockBacking::new(memory);
    let adapter = Arc::new_cyclic(|weak| {
        *backing.0.adapter.lock() = weak.clone();
        Adapter::new(0, backing.clone(), config)
    });
    (adapter, backing)
}

fn new_adapter() -> (Arc<Adapter<MockBacking>>, MockBacking) {
    new_adapter_with(EmulatedDmaAllocator::new(0x10_0000), test_config())
}

fn message(function: Function, len: usize) -> Vec<u8> {
    let mut msg = vec![0; len];
    msg[3] = function.0;
    msg
}

fn nvme_message(dev_handle: u16, data_format: u16) -> Vec<u8> {
    let mut msg = message(Function::NVME_ENCAPSULATED, 96);
    msg[10..12].copy_from_slice(&dev_handle.to_le_bytes());
    msg[NVME_ENCAPSULATED_COMMAND_OFFSET..][..2]
        .copy_from_slice(&(0x02 | (data_format << 14)).to_le_bytes());
    msg
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7) ^ seed).collect()
}

fn request<'a>(message: &'a [u8], buffers: Vec<BufferEntry<'a>>) -> MptRequest<'a> {
    MptRequest {
        message,
        buffers,
        timeout_secs: 30,
    }
}

#[test]
fn data_round_trip() {
    let (adapter, mock) = new_adapter();
    let seen = Arc::new(Mutex::new(Vec::new()));
    mock.set_firmware({
        let seen = seen.clone();
        move |fw: &FirmwareView<'_>| {
            let out = fw.sge(32);
            let inbound = fw.sge(32 + SGE_SIZE);
            assert_eq!(out.flags.into_bits(), 0x04);
            assert_eq!(inbound.flags.into_bits(), 0x0c);
            *seen.lock() = fw.read(out.address, out.length as usize);
            fw.write(inbound.address, &pattern(inbound.length as usize, 0x5a));
            Action::Complete(Response::success())
        }
    });

    let msg = message(Function::TOOLBOX, 32);
    let data_out = pattern(512, 0x11);
    let mut dout = data_out.clone();
    let mut din = vec![0u8; 1024];
    let completion = adapter
        .process_mpt_command(
            request(
                &msg,
                vec![
                    BufferEntry::new(BufferType::DATA_OUT, &mut dout),
                    BufferEntry::new(BufferType::DATA_IN, &mut din),
                ],
            ),
            LockMode::NonBlocking,
        )
        .unwrap();

    assert_eq!(completion.ioc_status, 0);
    assert_eq!(completion.reply_type, MpiReplyType::STATUS);
    assert_eq!(*seen.lock(), data_out);
    assert_eq!(din, pattern(1024, 0x5a));
    assert_eq!(dout, data_out);

    let posted = mock.posted();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0][..2], HostTag::IOCTL_CMDS.0.to_le_bytes());
    assert_eq!(mock.memory().live_allocations(), 0);
}

#[test]
fn status_reply_tagging() {
    let (adapter, mock) = new_adapter();
    mock.set_firmware(|_| {
        Action::Complete(Response {
            ioc_status: 0x8045,
            ioc_loginfo: 0x1122_3344,
            ..Default::default()
        })
    });

    let msg = message(Function::TOOLBOX, 16);
    let mut reply = vec![0xffu8; 4 + 128];
    let completion = adapter
        .process_mpt_command(
            request(&msg, vec![BufferEntry::new(BufferType::MPI_REPLY, &mut reply)]),
            LockMode::NonBlocking,
        )
        .unwrap();

    // Firmware failures are reported, not turned into errors.
    assert_eq!(completion.ioc_status, 0x0045);
    assert_eq!(completion.ioc_loginfo, 0x1122_3344);
    assert_eq!(completion.reply_type, MpiReplyType::STATUS);
    assert_eq!(reply[0], MpiReplyType::STATUS.0);
    assert_eq!(reply[4..6], 0x0045u16.to_le_bytes());
    assert_eq!(reply[6..8], [0, 0]);
    assert_eq!(reply[8..12], 0x1122_3344u32.to_le_bytes());
    assert!(reply[12..].iter().all(|&b| b == 0));
}

#[test]
fn address_reply_tagging() {
    let (adapter, mock) = new_adapter();
    let frame = pattern(128, 0x33);
    mock.set_firmware({
        let frame = frame.clone();
        move |_: &FirmwareView<'_>| {
            Action::Inline(Response {
                reply: Some(frame.clone()),
                ..Default::default()
            })
        }
    });

    let msg = message(Function::CONFIG, 24);
    let mut reply = vec![0u8; 4 + 128];
    let completion = adapter
        .process_mpt_command(
            request(&msg, vec![BufferEntry::new(BufferType::MPI_REPLY, &mut reply)]),
            LockMode::NonBlocking,
        )
        .unwrap();

    assert_eq!(completion.reply_type, MpiReplyType::ADDRESS);
    assert_eq!(reply[0], MpiReplyType::ADDRESS.0);
    assert_eq!(reply[4..], frame[..]);
}

#[test]
fn sense_data_is_returned() {
    let (adapter, mock) = new_adapter();
    mock.set_firmware(|_| {
        Action::Complete(Response {
            ioc_status: 0x0045,
            sense: Some(vec![0x70; 18]),
            ..Default::default()
        })
    });

    let msg = message(Function::SCSI_IO, 48);
    let mut din = vec![0u8; 512];
    let mut sense = vec![0xeeu8; 300];
    adapter
        .process_mpt_command(
            request(
                &msg,
                vec![
                    BufferEntry::new(BufferType::DATA_IN, &mut din),
                    BufferEntry::new(BufferType::ERR_RESPONSE, &mut sense),
                ],
            ),
            LockMode::NonBlocking,
        )
        .unwrap();

    assert_eq!(sense[..18], [0x70; 18]);
    assert!(sense[18..256].iter().all(|&b| b == 0));
    assert!(sense[256..].iter().all(|&b| b == 0xee));
}

#[test]
fn management_command_round_trip() {
    let (adapter, mock) = new_adapter();
    mock.set_firmware(|fw| {
        assert_eq!(fw.function(), Function::MGMT_PASSTHROUGH);
        let command = fw.sge(0x20);
        let response = fw.sge(0x30);
        assert_eq!(command.length as usize, 40 + 2 * SGE_SIZE);
        assert_eq!(command.flags.into_bits(), 0x0c);

        let body = fw.read(command.address, command.length as usize);
        assert_eq!(body[..40], [0xc0; 40]);
        let data_in = SimpleSge::read_from_bytes(&body[40..][..SGE_SIZE]).unwrap();
        let data_out = SimpleSge::read_from_bytes(&body[40 + SGE_SIZE..]).unwrap();
        assert_eq!(data_in.flags.into_bits(), 0x04);
        assert_eq!(data_out.flags.into_bits(), 0x0c);
        assert_eq!(fw.read(data_out.address, 64), vec![0xd0; 64]);

        fw.write(response.address, &[0x0a; 32]);
        fw.write(data_in.address, &pattern(data_in.length as usize, 1));
        Action::Complete(Response::success())
    });

    let msg = message(Function::MGMT_PASSTHROUGH, 64);
    let mut cmd = vec![0xc0u8; 40];
    let mut resp = vec![0u8; 32];
    let mut din = vec![0u8; 256];
    let mut dout = vec![0xd0u8; 64];
    adapter
        .process_mpt_command(
            request(
                &msg,
                vec![
                    BufferEntry::new(BufferType::RAIDMGMT_CMD, &mut cmd),
                    BufferEntry::new(BufferType::RAIDMGMT_RESP, &mut resp),
                    BufferEntry::new(BufferType::DATA_IN, &mut din),
                    BufferEntry::new(BufferType::DATA_OUT, &mut dout),
                ],
            ),
            LockMode::NonBlocking,
        )
        .unwrap();

    assert_eq!(resp, [0x0a; 32]);
    assert_eq!(din, pattern(256, 1));
    assert_eq!(cmd, [0xc0; 40]);
    assert_eq!(mock.memory().live_allocations(), 0);
}

#[test]
fn nvme_prp_list() {
    let (adapter, mock) = new_adapter();
    mock.add_device(5, 12);
    let prps = Arc::new(Mutex::new(Vec::new()));
    mock.set_firmware({
        let prps = prps.clone();
        move |fw: &FirmwareView<'_>| {
            let prp1: u64 = fw.obj(NVME_ENCAPSULATED_COMMAND_OFFSET + NVME_CMD_PRP1_OFFSET);
            let prp2: u64 = fw.obj(NVME_ENCAPSULATED_COMMAND_OFFSET + NVME_CMD_PRP2_OFFSET);
            let list: Vec<u64> = fw
                .read(prp2, 3 * 8)
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
                .collect();
            *prps.lock() = [vec![prp1, prp2], list].concat();
            fw.write(prp1, &pattern(3 * 4096 + 100, 9));
            Action::Complete(Response::success())
        }
    });

    let msg = nvme_message(5, 0);
    let mut din = vec![0u8; 3 * 4096 + 100];
    adapter
        .process_mpt_command(
            request(&msg, vec![BufferEntry::new(BufferType::DATA_IN, &mut din)]),
            LockMode::NonBlocking,
        )
        .unwrap();

    let prps = prps.lock().clone();
    let data = prps[0];
    assert_eq!(data % 4096, 0);
    assert_eq!(prps[1] % 4096, 0);
    assert_ne!(prps[1], data);
    assert_eq!(prps[2..], [data + 4096, data + 2 * 4096, data + 3 * 4096]);
    assert_eq!(din, pattern(3 * 4096 + 100, 9));
    // The data buffer and the prp list page are both released.
    assert_eq!(mock.memory().allocation_count(), 2);
    assert_eq!(mock.memory().live_allocations(), 0);
}

#[test]
fn nvme_unknown_device() {
    let (adapter, mock) = new_adapter();
    let msg = nvme_message(9, 0);
    let mut dout = vec![1u8; 4096];
    let err = adapter
        .process_mpt_command(
            request(&msg, vec![BufferEntry::new(BufferType::DATA_OUT, &mut dout)]),
            LockMode::NonBlocking,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        PassthroughError::PrpConstruction(PrpError::UnknownDevice(9))
    ));
    assert_eq!(err.errno(), errno::ENOMEM);
    assert!(mock.posted().is_empty());
    assert_eq!(mock.memory().live_allocations(), 0);

    // The slot was released.
    mock.add_device(9, 0);
    let err = adapter
        .process_mpt_command(
            request(&msg, vec![BufferEntry::new(BufferType::DATA_OUT, &mut dout)]),
            LockMode::NonBlocking,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        PassthroughError::PrpConstruction(PrpError::PageSizeUnknown(9))
    ));

    mock.add_device(9, 12);
    adapter
        .process_mpt_command(
            request(&msg, vec![BufferEntry::new(BufferType::DATA_OUT, &mut dout)]),
            LockMode::NonBlocking,
        )
        .unwrap();
}

#[test]
fn nvme_sgl_with_modifier() {
    let mut config = test_config();
    config.facts.sge_modifier_mask = 0x0f;
    config.facts.sge_modifier_value = 0x08;
    config.facts.sge_modifier_shift = 24;
    let (adapter, mock) = new_adapter_with(EmulatedDmaAllocator::new(0x10_0000), config);
    let seen = Arc::new(Mutex::new(None));
    mock.set_firmware({
        let seen = seen.clone();
        move |fw: &FirmwareView<'_>| {
            let sge: NvmePassthroughSge =
                fw.obj(NVME_ENCAPSULATED_COMMAND_OFFSET + NVME_CMD_SGL_OFFSET);
            *seen.lock() = Some((sge.base_addr, sge.length));
            fw.write(sge.base_addr & !0x0f00_0000_0000_0000, &[0x42; 2048]);
            Action::Complete(Response::success())
        }
    });

    let msg = nvme_message(3, 1);
    let mut din = vec![0u8; 2048];
    adapter
        .process_mpt_command(
            request(&msg, vec![BufferEntry::new(BufferType::DATA_IN, &mut din)]),
            LockMode::NonBlocking,
        )
        .unwrap();

    let (address, length) = seen.lock().unwrap();
    assert_eq!(address >> 56, 0x08);
    assert_eq!(length, 2048);
    assert_eq!(din, [0x42; 2048]);
}

#[test]
fn nvme_sgl_address_collision() {
    let mut config = test_config();
    config.facts.sge_modifier_mask = 0x0f;
    config.facts.sge_modifier_value = 0x08;
    config.facts.sge_modifier_shift = 24;
    let (adapter, mock) =
        new_adapter_with(EmulatedDmaAllocator::new(0x0100_0000_0000_0000), config);

    let msg = nvme_message(3, 2);
    let mut din = vec![0u8; 512];
    let err = adapter
        .process_mpt_command(
            request(&msg, vec![BufferEntry::new(BufferType::DATA_IN, &mut din)]),
            LockMode::NonBlocking,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        PassthroughError::AddressCollision {
            entry: DescriptorEntry::Sgl
        }
    ));
    assert_eq!(err.errno(), errno::EINVAL);
    assert!(mock.posted().is_empty());
    assert_eq!(mock.memory().live_allocations(), 0);
}

#[test]
fn nvme_reserved_data_format() {
    let (adapter, mock) = new_adapter();
    let msg = nvme_message(3, 3);
    let mut din = vec![0u8; 512];
    let err = adapter
        .process_mpt_command(
            request(&msg, vec![BufferEntry::new(BufferType::DATA_IN, &mut din)]),
            LockMode::NonBlocking,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        PassthroughError::InvalidRequest(InvalidRequest::NvmeDataFormat(3))
    ));
    assert!(mock.posted().is_empty());
}

#[test]
fn timeout_requests_one_reset() {
    let (adapter, mock) = new_adapter_with(
        EmulatedDmaAllocator::new(0x10_0000),
        AdapterConfig {
            min_command_timeout: Duration::from_millis(50),
            ..test_config()
        },
    );
    mock.set_firmware(|_| Action::Ignore);

    let msg = message(Function::TOOLBOX, 16);
    let mut din = vec![0u8; 64];
    let start = Instant::now();
    let err = adapter
        .process_mpt_command(
            MptRequest {
                message: &msg,
                buffers: vec![BufferEntry::new(BufferType::DATA_IN, &mut din)],
                timeout_secs: 0,
            },
            LockMode::NonBlocking,
        )
        .unwrap_err();
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(matches!(err, PassthroughError::TimedOut));
    assert_eq!(err.errno(), errno::EFAULT);
    assert!(!err.is_retryable());
    assert_eq!(
        *mock.0.soft_resets.lock(),
        [(ResetReason::PassthroughTimeout, true)]
    );
    assert_eq!(mock.posted().len(), 1);
    assert_eq!(mock.memory().live_allocations(), 0);

    // A late completion is dropped.
    assert!(!Response::success().deliver(&adapter, HostTag::IOCTL_CMDS));
}

#[test]
fn timeout_during_reset_does_not_reset_again() {
    let (adapter, mock) = new_adapter_with(
        EmulatedDmaAllocator::new(0x10_0000),
        AdapterConfig {
            min_command_timeout: Duration::from_millis(200),
            ..test_config()
        },
    );
    mock.set_firmware(|_| Action::Ignore);

    let msg = message(Function::TOOLBOX, 16);
    std::thread::scope(|s| {
        s.spawn(|| {
            mock.wait_for_posts(1);
            adapter.set_reset_in_progress(true);
        });
        let mut din = vec![0u8; 64];
        let err = adapter
            .process_mpt_command(
                MptRequest {
                    message: &msg,
                    buffers: vec![BufferEntry::new(BufferType::DATA_IN, &mut din)],
                    timeout_secs: 0,
                },
                LockMode::NonBlocking,
            )
            .unwrap_err();
        assert!(matches!(err, PassthroughError::TimedOut));
    });
    assert!(mock.0.soft_resets.lock().is_empty());
}

#[test]
fn reset_aborts_pending_command() {
    let (adapter, mock) = new_adapter();
    mock.set_firmware(|_| Action::Ignore);

    let msg = message(Function::TOOLBOX, 16);
    std::thread::scope(|s| {
        s.spawn(|| {
            mock.wait_for_posts(1);
            adapter.abort_pending_commands();
        });
        let mut din = vec![0u8; 64];
        let err = adapter
            .process_mpt_command(
                request(&msg, vec![BufferEntry::new(BufferType::DATA_IN, &mut din)]),
                LockMode::NonBlocking,
            )
            .unwrap_err();
        assert!(matches!(err, PassthroughError::Aborted));
    });
    assert!(mock.0.soft_resets.lock().is_empty());
    assert_eq!(mock.memory().live_allocations(), 0);
}

#[test]
fn busy_adapter_states() {
    let (adapter, mock) = new_adapter();
    let msg = message(Function::TOOLBOX, 16);
    let mut din = vec![0u8; 64];

    adapter.set_reset_in_progress(true);
    let err = adapter
        .process_mpt_command(
            request(&msg, vec![BufferEntry::new(BufferType::DATA_IN, &mut din)]),
            LockMode::NonBlocking,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        PassthroughError::Busy(BusyReason::ResetInProgress)
    ));
    assert!(err.is_retryable());
    adapter.set_reset_in_progress(false);

    adapter.set_ioctls_blocked(true);
    let err = adapter
        .process_mpt_command(
            request(&msg, vec![BufferEntry::new(BufferType::DATA_IN, &mut din)]),
            LockMode::NonBlocking,
        )
        .unwrap_err();
    assert!(matches!(err, PassthroughError::Busy(BusyReason::IoctlsBlocked)));
    assert_eq!(err.errno(), errno::EAGAIN);
    adapter.set_ioctls_blocked(false);

    assert!(mock.posted().is_empty());
    assert_eq!(mock.memory().live_allocations(), 0);

    adapter
        .process_mpt_command(
            request(&msg, vec![BufferEntry::new(BufferType::DATA_IN, &mut din)]),
            LockMode::NonBlocking,
        )
        .unwrap();
}

#[test]
fn post_failure_is_busy() {
    let (adapter, mock) = new_adapter();
    mock.set_firmware(|_| Action::Reject);
    let msg = message(Function::TOOLBOX, 16);
    let mut din = vec![0u8; 8];
    let err = adapter
        .process_mpt_command(
            request(&msg, vec![BufferEntry::new(BufferType::DATA_IN, &mut din)]),
            LockMode::NonBlocking,
        )
        .unwrap_err();
    assert!(matches!(err, PassthroughError::Busy(BusyReason::PostFailed)));
    assert_eq!(err.errno(), errno::EAGAIN);

    mock.set_firmware(|_| Action::Complete(Response::success()));
    adapter
        .process_mpt_command(
            request(&msg, vec![BufferEntry::new(BufferType::DATA_IN, &mut din)]),
            LockMode::NonBlocking,
        )
        .unwrap();
}

#[test]
fn concurrent_commands_serialize() {
    let (adapter, mock) = new_adapter();
    mock.set_firmware(|_| Action::Defer(Response::success()));
    let msg = message(Function::TOOLBOX, 16);
    let interrupt = Interrupt::new();

    std::thread::scope(|s| {
        let first = s.spawn(|| {
            let mut din = vec![0u8; 64];
            adapter.process_mpt_command(
                request(&msg, vec![BufferEntry::new(BufferType::DATA_IN, &mut din)]),
                LockMode::NonBlocking,
            )
        });
        mock.wait_for_posts(1);

        let mut din = vec![0u8; 64];
        let err = adapter
            .process_mpt_command(
                request(&msg, vec![BufferEntry::new(BufferType::DATA_IN, &mut din)]),
                LockMode::NonBlocking,
            )
            .unwrap_err();
        assert!(matches!(err, PassthroughError::Busy(BusyReason::SlotInUse)));
        assert!(err.is_retryable());

        interrupt.raise();
        let err = adapter
            .process_mpt_command(
                request(&msg, vec![BufferEntry::new(BufferType::DATA_IN, &mut din)]),
                LockMode::Blocking(&interrupt),
            )
            .unwrap_err();
        assert!(matches!(err, PassthroughError::Interrupted));
        assert_eq!(err.errno(), errno::ERESTARTSYS);

        assert_eq!(mock.complete_deferred(), 1);
        first.join().unwrap().unwrap();
    });

    assert_eq!(mock.posted().len(), 1);
    assert_eq!(mock.memory().live_allocations(), 0);
}

#[test]
fn blocking_commands_run_in_turn() {
    let (adapter, mock) = new_adapter();
    let msg = message(Function::TOOLBOX, 16);
    let interrupt = Interrupt::new();
    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let mut din = vec![0u8; 64];
                adapter
                    .process_mpt_command(
                        request(&msg, vec![BufferEntry::new(BufferType::DATA_IN, &mut din)]),
                        LockMode::Blocking(&interrupt),
                    )
                    .unwrap();
            });
        }
    });
    assert_eq!(mock.posted().len(), 4);
    assert_eq!(mock.memory().live_allocations(), 0);
}

#[test]
fn invalid_requests_have_no_side_effects() {
    let (adapter, mock) = new_adapter();
    let msg = message(Function::TOOLBOX, 16);

    let err = adapter
        .process_mpt_command(request(&msg, Vec::new()), LockMode::NonBlocking)
        .unwrap_err();
    assert!(matches!(
        err,
        PassthroughError::InvalidRequest(InvalidRequest::NoBuffers)
    ));

    let mut a = vec![0u8; 64];
    let mut b = vec![0u8; 64];
    let err = adapter
        .process_mpt_command(
            request(
                &msg,
                vec![
                    BufferEntry::new(BufferType::DATA_IN, &mut a),
                    BufferEntry::new(BufferType::DATA_IN, &mut b),
                ],
            ),
            LockMode::NonBlocking,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        PassthroughError::InvalidRequest(InvalidRequest::MultipleDataIn)
    ));
    assert_eq!(err.errno(), errno::EINVAL);

    let long = message(Function::TOOLBOX, 112);
    let err = adapter
        .process_mpt_command(
            request(
                &long,
                vec![
                    BufferEntry::new(BufferType::DATA_IN, &mut a),
                    BufferEntry::new(BufferType::DATA_OUT, &mut b),
                ],
            ),
            LockMode::NonBlocking,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        PassthroughError::InvalidRequest(InvalidRequest::SglOverflow(2, 112))
    ));

    // The message leaves no room for the terminating sge.
    let mut reply = vec![0u8; 4 + 128];
    for len in [116, 128] {
        let full = message(Function::TOOLBOX, len);
        let err = adapter
            .process_mpt_command(
                request(&full, vec![BufferEntry::new(BufferType::MPI_REPLY, &mut reply)]),
                LockMode::NonBlocking,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            PassthroughError::InvalidRequest(InvalidRequest::SglOverflow(1, n)) if n == len
        ));
    }

    assert!(mock.posted().is_empty());
    assert_eq!(mock.memory().allocation_count(), 0);
}

#[test]
fn largest_message_without_data_keeps_terminator() {
    let (adapter, mock) = new_adapter();
    let mut reply = vec![0u8; 4 + 128];
    let fits = message(Function::TOOLBOX, 112);
    adapter
        .process_mpt_command(
            request(&fits, vec![BufferEntry::new(BufferType::MPI_REPLY, &mut reply)]),
            LockMode::NonBlocking,
        )
        .unwrap();
    let posted = mock.posted();
    assert_eq!(posted.len(), 1);
    let terminator = SimpleSge::read_from_bytes(&posted[0][112..][..SGE_SIZE]).unwrap();
    assert_eq!(terminator.address, !0);
    assert_eq!(terminator.length, 0);
    assert_eq!(terminator.flags, SimpleSge::zero_length().flags);
}

#[test]
fn adapter_info() {
    let mut config = test_config();
    config.pci.device_id = 0x00a5;
    config.pci.vendor_id = 0x1000;
    config.pci.bus = 3;
    config.pci.device = 2;
    config.pci.function = 1;
    config.driver_info.driver_name = "mpi3mr".into();
    let (adapter, _mock) = new_adapter_with(EmulatedDmaAllocator::new(0), config);

    let info = adapter.adapter_info(LockMode::NonBlocking).unwrap();
    assert_eq!(info.adp_type, 1);
    assert_eq!(info.pci_dev_id, 0xa5);
    assert_eq!(info.pci_bus, 3);
    assert_eq!(info.pci_dev, 2);
    assert_eq!(info.pci_func, 1);
    assert_eq!(info.ioctl_ver, mpi3_spec::ioctl::IOCTL_VERSION);
    assert_eq!(&info.driver_info.driver_name[..7], b"mpi3mr\0");
    assert_eq!(info.driver_info.information_length, 120);
}

#[test]
fn all_target_info() {
    let (adapter, mock) = new_adapter();
    *mock.0.targets.lock() = vec![
        TargetDevice {
            dev_handle: 1,
            persistent_id: 10,
            host_address: Some(HostAddress {
                bus_id: 0,
                target_id: 3,
            }),
        },
        TargetDevice {
            dev_handle: 2,
            persistent_id: 11,
            host_address: None,
        },
        TargetDevice {
            dev_handle: 3,
            persistent_id: 12,
            host_address: Some(HostAddress {
                bus_id: 1,
                target_id: 7,
            }),
        },
    ];

    let info = adapter.all_target_info(LockMode::NonBlocking, 2).unwrap();
    assert_eq!(info.num_devices, 3);
    assert_eq!(info.entries.len(), 2);
    assert_eq!(info.entries[0].handle, 1);
    assert_eq!(info.entries[0].target_id, 3);
    assert_eq!(info.entries[0].bus_id, 0);
    assert_eq!(info.entries[1].perst_id, 11);
    assert_eq!(info.entries[1].target_id, u32::MAX);
    assert_eq!(info.entries[1].bus_id, 0xff);

    let info = adapter.all_target_info(LockMode::NonBlocking, 0).unwrap();
    assert_eq!(info.num_devices, 3);
    assert!(info.entries.is_empty());
}

#[test]
fn log_data_cache() {
    let (adapter, _mock) = new_adapter();
    adapter.record_log_data(&[1, 2, 3]);
    let err = adapter
        .get_log_data(LockMode::NonBlocking, 4096)
        .unwrap_err();
    assert!(matches!(
        err,
        PassthroughError::InvalidRequest(InvalidRequest::LogDataDisabled)
    ));

    let enable = adapter.enable_log_data(LockMode::NonBlocking).unwrap();
    assert_eq!(enable.max_entries, 400);
    adapter.record_log_data(&[1, 2, 3]);
    adapter.record_log_data(&[4, 5]);
    adapter.record_log_data(&[6]);

    // 128 byte replies less the event header, plus the entry header.
    let entry_size = 108;
    let data = adapter
        .get_log_data(LockMode::NonBlocking, 2 * entry_size + 5)
        .unwrap();
    assert_eq!(data.len(), 2 * entry_size);
    assert_eq!(data[..7], [1, 0, 0, 0, 1, 2, 3]);
    assert_eq!(data[entry_size..][..6], [1, 0, 0, 0, 4, 5]);

    let err = adapter
        .get_log_data(LockMode::NonBlocking, entry_size - 1)
        .unwrap_err();
    assert!(matches!(
        err,
        PassthroughError::InvalidRequest(InvalidRequest::LogDataBufferTooSmall(107))
    ));

    // Enabling again keeps the cached entries.
    adapter.enable_log_data(LockMode::NonBlocking).unwrap();
    let data = adapter
        .get_log_data(LockMode::NonBlocking, entry_size)
        .unwrap();
    assert_eq!(data[4..7], [1, 2, 3]);
}

#[test]
fn change_count_and_reset() {
    let (adapter, mock) = new_adapter();
    adapter.set_change_count(7);
    assert_eq!(
        adapter
            .get_change_count(LockMode::NonBlocking)
            .unwrap()
            .change_count,
        7
    );

    adapter
        .adapter_reset(LockMode::NonBlocking, ResetType::SOFT)
        .unwrap();
    adapter
        .adapter_reset(LockMode::NonBlocking, ResetType::DIAG_FAULT)
        .unwrap();
    let err = adapter
        .adapter_reset(LockMode::NonBlocking, ResetType(9))
        .unwrap_err();
    assert!(matches!(
        err,
        PassthroughError::InvalidRequest(InvalidRequest::ResetType(9))
    ));
    assert_eq!(
        *mock.0.soft_resets.lock(),
        [(ResetReason::ManagementRequest, false)]
    );
    assert_eq!(
        *mock.0.diag_resets.lock(),
        [ResetReason::ManagementRequest]
    );
}

fn pel_reply(status: PelStatus) -> Vec<u8> {
    let mut reply = PelReply::new_zeroed();
    reply.function = Function::PERSISTENT_EVENT_LOG;
    reply.pe_log_status = status.0;
    reply.as_bytes().to_vec()
}

#[test]
fn pel_enable_widens_settings() {
    let (adapter, mock) = new_adapter();
    mock.set_firmware(|fw| {
        assert_eq!(fw.function(), Function::PERSISTENT_EVENT_LOG);
        assert_eq!(fw.frame[0x0c], mpi3_spec::PelAction::ABORT.0);
        assert_eq!(fw.frame[0x10..0x12], HostTag::PEL_WAIT.0.to_le_bytes());
        Action::Complete(Response {
            reply: Some(pel_reply(PelStatus::SUCCESS)),
            ..Default::default()
        })
    });

    adapter
        .enable_pel(LockMode::NonBlocking, PelClass::WARNING, 0x0010)
        .unwrap();
    // Already covered.
    adapter
        .enable_pel(LockMode::NonBlocking, PelClass::CRITICAL, 0x0010)
        .unwrap();
    assert!(mock.posted().is_empty());

    adapter
        .enable_pel(LockMode::NonBlocking, PelClass::INFORMATIONAL, 0x0002)
        .unwrap();
    let posted = mock.posted();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0][..2], HostTag::PEL_ABORT.0.to_le_bytes());
    assert_eq!(
        *mock.0.pel_requests.lock(),
        [
            (PelClass::WARNING, 0x0010),
            (PelClass::INFORMATIONAL, 0x0012)
        ]
    );

    let err = adapter
        .enable_pel(LockMode::NonBlocking, PelClass(7), 0)
        .unwrap_err();
    assert!(matches!(
        err,
        PassthroughError::InvalidRequest(InvalidRequest::PelClass(7))
    ));
}

#[test]
fn pel_abort_failure_keeps_settings() {
    let (adapter, mock) = new_adapter();
    mock.set_firmware(|_| {
        Action::Complete(Response {
            reply: Some(pel_reply(PelStatus::ABORTED)),
            ..Default::default()
        })
    });

    adapter
        .enable_pel(LockMode::NonBlocking, PelClass::WARNING, 0x0001)
        .unwrap();
    let err = adapter
        .enable_pel(LockMode::NonBlocking, PelClass::DEBUG, 0x0001)
        .unwrap_err();
    assert!(matches!(err, PassthroughError::PelStatus(2)));
    assert_eq!(mock.0.pel_requests.lock().len(), 1);

    // The earlier settings are still in force.
    adapter
        .enable_pel(LockMode::NonBlocking, PelClass::FATAL, 0x0001)
        .unwrap();
    assert_eq!(mock.posted().len(), 1);
}

#[test]
fn pel_request_failure_rolls_back() {
    let (adapter, mock) = new_adapter();
    mock.0.fail_pel_requests.store(true, Ordering::SeqCst);
    let err = adapter
        .enable_pel(LockMode::NonBlocking, PelClass::WARNING, 0x0001)
        .unwrap_err();
    assert!(matches!(err, PassthroughError::Controller(_)));

    // Not enabled, so no abort is needed on the next attempt.
    mock.0.fail_pel_requests.store(false, Ordering::SeqCst);
    adapter
        .enable_pel(LockMode::NonBlocking, PelClass::WARNING, 0x0001)
        .unwrap();
    assert!(mock.posted().is_empty());
}

#[test]
fn registry_lookup() {
    let (adapter, _mock) = new_adapter();
    let registry = AdapterRegistry::new();
    assert!(registry.insert(adapter.clone()).is_none());
    assert!(Arc::ptr_eq(&registry.adapter(0).unwrap(), &adapter));

    let err = registry.adapter(1).unwrap_err();
    assert!(matches!(err, PassthroughError::NoDevice(1)));
    assert_eq!(err.errno(), errno::ENODEV);

    assert!(registry.remove(0).is_some());
    assert!(registry.lookup(0).is_none());
    assert!(registry.ids().is_empty());
}
