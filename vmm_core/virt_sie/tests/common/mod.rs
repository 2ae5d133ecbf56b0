// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared mock collaborators for the integration tests.

// Each test binary uses its own subset of the mock surface.
#![expect(dead_code)]

use parking_lot::Condvar;
use parking_lot::Mutex;
use siedef::ExecutionControlBlock;
use siedef::FacilitySet;
use siedef::FeatureSet;
use siedef::GuestRegisters;
use siedef::InterceptCode;
use siedef::ProtectedCpuState;
use siedef::SubfunctionSet;
use siedef::facility;
use siedef::feature;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use virt_sie::CpuIdentity;
use virt_sie::CpuProtectionHandle;
use virt_sie::EntryError;
use virt_sie::ExitCause;
use virt_sie::FirmwareError;
use virt_sie::GuestEvent;
use virt_sie::GuestEventSink;
use virt_sie::GuestPager;
use virt_sie::InterceptDisposition;
use virt_sie::InterceptHandler;
use virt_sie::PageClassifier;
use virt_sie::PagerError;
use virt_sie::ProtectionFirmware;
use virt_sie::SieConfig;
use virt_sie::SieHardware;
use virt_sie::SiePartition;
use virt_sie::SiePartitionParams;
use virt_sie::VmProtectionHandle;
use virt_sie::VpIndex;

/// Returns a host facility set with everything the engine consults.
pub fn full_facilities() -> FacilitySet {
    let mut set = FacilitySet::empty();
    set.set(facility::INTERPRETATION_BUFFERING, true)
        .set(facility::CLASSIFICATION_ASSIST, true)
        .set(facility::EXTENDED_CPU_TABLE, true)
        .set(facility::PROTECTED_EXECUTION, true)
        .set(facility::EPOCH_EXTENSION, true)
        .set(facility::NESTED_INTERPRETATION, true);
    set
}

/// Returns a host feature set with everything the engine consults.
pub fn full_features() -> FeatureSet {
    let mut set = FeatureSet::empty();
    set.set(feature::ASYNC_FAULT, true)
        .set(feature::CLASSIFICATION, true)
        .set(feature::NESTED_INTERPRETATION, true);
    set
}

fn host_subfunctions() -> SubfunctionSet {
    let mut set = SubfunctionSet::new();
    set.cipher_message[0] = 0xf0;
    set.compute_digest[0] = 0xe0;
    set
}

#[derive(Default)]
struct HardwareState {
    script: HashMap<u32, VecDeque<Result<ExitCause, EntryError>>>,
    kicked: HashSet<u32>,
    held: HashSet<u32>,
    in_guest: HashSet<u32>,
}

/// Scriptable hardware seam.
///
/// Each vCPU has a queue of exit causes; an entry pops the front, or
/// reports an interruption when the queue is empty. Kicks are sticky, as
/// the real seam requires. A test can also hold a vCPU inside guest mode
/// to create a deterministic in-guest window.
pub struct MockHardware {
    facilities: FacilitySet,
    features: FeatureSet,
    clock: AtomicU64,
    state: Mutex<HardwareState>,
    cond: Condvar,
    entries: AtomicU64,
}

impl MockHardware {
    pub fn new() -> Arc<Self> {
        Self::with_facilities(full_facilities())
    }

    pub fn with_facilities(facilities: FacilitySet) -> Arc<Self> {
        Arc::new(Self {
            facilities,
            features: full_features(),
            clock: AtomicU64::new(0x10_0000),
            state: Mutex::new(HardwareState::default()),
            cond: Condvar::new(),
            entries: AtomicU64::new(0),
        })
    }

    /// Queues `cause` as the result of a future entry of `vp`.
    pub fn push_exit(&self, vp: VpIndex, cause: ExitCause) {
        self.state
            .lock()
            .script
            .entry(vp.index())
            .or_default()
            .push_back(Ok(cause));
    }

    /// Queues an entry failure for `vp`.
    pub fn push_entry_error(&self, vp: VpIndex, code: u16) {
        self.state
            .lock()
            .script
            .entry(vp.index())
            .or_default()
            .push_back(Err(EntryError { code }));
    }

    /// Keeps future entries of `vp` inside guest mode until released or
    /// kicked.
    pub fn hold_in_guest(&self, vp: VpIndex) {
        self.state.lock().held.insert(vp.index());
    }

    /// Releases a hold placed by [`Self::hold_in_guest`].
    pub fn release(&self, vp: VpIndex) {
        let mut state = self.state.lock();
        state.held.remove(&vp.index());
        self.cond.notify_all();
    }

    /// Blocks until `vp` is inside a held entry.
    pub fn wait_in_guest(&self, vp: VpIndex) {
        let mut state = self.state.lock();
        while !state.in_guest.contains(&vp.index()) {
            self.cond.wait(&mut state);
        }
    }

    pub fn advance_clock(&self, delta: u64) {
        self.clock.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::SeqCst)
    }
}

impl SieHardware for MockHardware {
    fn host_facilities(&self) -> FacilitySet {
        self.facilities
    }

    fn host_features(&self) -> FeatureSet {
        self.features
    }

    fn host_subfunctions(&self) -> SubfunctionSet {
        host_subfunctions()
    }

    fn host_identity(&self) -> CpuIdentity {
        CpuIdentity {
            cpu_id: 0x00d1_2345_6789_0000,
            version: 7,
        }
    }

    fn wall_clock(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    fn run_guest(
        &self,
        vp: VpIndex,
        scb: &mut ExecutionControlBlock,
        _regs: &mut GuestRegisters,
    ) -> Result<ExitCause, EntryError> {
        self.entries.fetch_add(1, Ordering::SeqCst);
        scb.controls.set_flush_tlb(false);
        let mut state = self.state.lock();
        if state.held.contains(&vp.index()) {
            state.in_guest.insert(vp.index());
            self.cond.notify_all();
            while state.held.contains(&vp.index()) && !state.kicked.contains(&vp.index()) {
                self.cond.wait(&mut state);
            }
            state.in_guest.remove(&vp.index());
            self.cond.notify_all();
        }
        if state.kicked.remove(&vp.index()) {
            return Ok(ExitCause::Interrupted);
        }
        match state.script.get_mut(&vp.index()).and_then(|q| q.pop_front()) {
            Some(result) => result,
            None => Ok(ExitCause::Interrupted),
        }
    }

    fn kick(&self, vp: VpIndex) {
        let mut state = self.state.lock();
        state.kicked.insert(vp.index());
        self.cond.notify_all();
    }
}

/// One recorded [`GuestPager::resolve_fault`] call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResolveCall {
    pub vp: u32,
    pub gpa: u64,
    pub write: bool,
    pub can_block: bool,
}

#[derive(Default)]
struct PagerState {
    errors: HashMap<u64, VecDeque<PagerError>>,
    resolves: Vec<ResolveCall>,
    mapped: Vec<(u64, u64)>,
    unmapped: Vec<(u64, u64)>,
    invalidated: Vec<u64>,
    unshares: u32,
    fail_unshare: bool,
}

/// Recording pager with per-address scripted failures.
#[derive(Default)]
pub struct MockPager {
    state: Mutex<PagerState>,
}

impl MockPager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Scripts the next operation on `gpa` to fail with `err`.
    pub fn fail_next(&self, gpa: u64, err: PagerError) {
        self.state
            .lock()
            .errors
            .entry(gpa)
            .or_default()
            .push_back(err);
    }

    pub fn fail_unshare(&self) {
        self.state.lock().fail_unshare = true;
    }

    pub fn resolves(&self) -> Vec<ResolveCall> {
        self.state.lock().resolves.clone()
    }

    pub fn mapped(&self) -> Vec<(u64, u64)> {
        self.state.lock().mapped.clone()
    }

    pub fn unmapped(&self) -> Vec<(u64, u64)> {
        self.state.lock().unmapped.clone()
    }

    pub fn invalidated(&self) -> Vec<u64> {
        self.state.lock().invalidated.clone()
    }

    pub fn unshares(&self) -> u32 {
        self.state.lock().unshares
    }
}

impl GuestPager for MockPager {
    fn resolve_fault(
        &self,
        vp: VpIndex,
        gpa: u64,
        write: bool,
        can_block: bool,
    ) -> Result<(), PagerError> {
        let mut state = self.state.lock();
        state.resolves.push(ResolveCall {
            vp: vp.index(),
            gpa,
            write,
            can_block,
        });
        match state.errors.get_mut(&gpa).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn map_segment(&self, gpa: u64, len: u64) -> Result<(), PagerError> {
        let mut state = self.state.lock();
        match state.errors.get_mut(&gpa).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => {
                state.mapped.push((gpa, len));
                Ok(())
            }
        }
    }

    fn unmap_segment(&self, gpa: u64, len: u64) {
        self.state.lock().unmapped.push((gpa, len));
    }

    fn unshare_all(&self) -> Result<(), PagerError> {
        let mut state = self.state.lock();
        state.unshares += 1;
        if state.fail_unshare {
            Err(PagerError::Fatal)
        } else {
            Ok(())
        }
    }

    fn invalidate_secure(&self, gpa: u64) -> Result<(), PagerError> {
        let mut state = self.state.lock();
        state.invalidated.push(gpa);
        match state.errors.get_mut(&gpa).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// One recorded firmware call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareEvent {
    CreateVm(u64),
    DestroyVm(u64),
    CreateCpu { vm: u64, vp: u32, handle: u64 },
    DestroyCpu(u64),
    SetCpuState { handle: u64, state: u8 },
    ImportPage { vm: u64, gpa: u64 },
}

#[derive(Default)]
struct FirmwareState {
    events: Vec<FirmwareEvent>,
    fail_create_vm: bool,
    fail_create_cpu_for: Option<u32>,
    fail_destroy_cpu: HashSet<u64>,
    fail_destroy_vm: bool,
    fail_set_state: bool,
    live_vms: HashSet<u64>,
    live_cpus: HashSet<u64>,
}

/// Recording protected-execution firmware with failure injection.
///
/// Destroy failures report the handle in the reason code so a test can
/// tell which teardown step's diagnostic came back.
#[derive(Default)]
pub struct MockFirmware {
    next_handle: AtomicU64,
    state: Mutex<FirmwareState>,
}

impl MockFirmware {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<FirmwareEvent> {
        self.state.lock().events.clone()
    }

    /// Live VM and CPU context counts.
    pub fn live(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.live_vms.len(), state.live_cpus.len())
    }

    pub fn fail_create_vm(&self) {
        self.state.lock().fail_create_vm = true;
    }

    pub fn fail_create_cpu_for(&self, vp: VpIndex) {
        self.state.lock().fail_create_cpu_for = Some(vp.index());
    }

    pub fn fail_destroy_cpu(&self, handle: u64) {
        self.state.lock().fail_destroy_cpu.insert(handle);
    }

    pub fn fail_destroy_vm(&self) {
        self.state.lock().fail_destroy_vm = true;
    }

    pub fn fail_set_state(&self) {
        self.state.lock().fail_set_state = true;
    }

    fn allocate(&self) -> u64 {
        0x1000 + self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

impl ProtectionFirmware for MockFirmware {
    fn create_vm(&self) -> Result<VmProtectionHandle, FirmwareError> {
        let mut state = self.state.lock();
        if state.fail_create_vm {
            return Err(FirmwareError { rc: 0x100, rrc: 1 });
        }
        let raw = self.allocate();
        state.live_vms.insert(raw);
        state.events.push(FirmwareEvent::CreateVm(raw));
        Ok(VmProtectionHandle::new(raw))
    }

    fn destroy_vm(&self, handle: VmProtectionHandle) -> Result<(), FirmwareError> {
        let raw = handle.raw();
        let mut state = self.state.lock();
        state.events.push(FirmwareEvent::DestroyVm(raw));
        if state.fail_destroy_vm {
            return Err(FirmwareError {
                rc: 0x104,
                rrc: raw as u16,
            });
        }
        state.live_vms.remove(&raw);
        Ok(())
    }

    fn create_cpu(
        &self,
        vm: &VmProtectionHandle,
        vp: VpIndex,
    ) -> Result<CpuProtectionHandle, FirmwareError> {
        let mut state = self.state.lock();
        if state.fail_create_cpu_for == Some(vp.index()) {
            return Err(FirmwareError { rc: 0x102, rrc: 2 });
        }
        let raw = self.allocate();
        state.live_cpus.insert(raw);
        state.events.push(FirmwareEvent::CreateCpu {
            vm: vm.raw(),
            vp: vp.index(),
            handle: raw,
        });
        Ok(CpuProtectionHandle::new(raw))
    }

    fn destroy_cpu(&self, handle: CpuProtectionHandle) -> Result<(), FirmwareError> {
        let raw = handle.raw();
        let mut state = self.state.lock();
        state.events.push(FirmwareEvent::DestroyCpu(raw));
        if state.fail_destroy_cpu.remove(&raw) {
            return Err(FirmwareError {
                rc: 0x105,
                rrc: raw as u16,
            });
        }
        state.live_cpus.remove(&raw);
        Ok(())
    }

    fn set_cpu_state(
        &self,
        handle: &CpuProtectionHandle,
        state: ProtectedCpuState,
    ) -> Result<(), FirmwareError> {
        let mut inner = self.state.lock();
        inner.events.push(FirmwareEvent::SetCpuState {
            handle: handle.raw(),
            state: state.into(),
        });
        if inner.fail_set_state {
            return Err(FirmwareError { rc: 0x106, rrc: 3 });
        }
        Ok(())
    }

    fn import_page(&self, vm: &VmProtectionHandle, gpa: u64) -> Result<(), FirmwareError> {
        self.state
            .lock()
            .events
            .push(FirmwareEvent::ImportPage { vm: vm.raw(), gpa });
        Ok(())
    }
}

/// Classification store with a configurable default byte.
pub struct MockClassifier {
    default: u8,
    state: Mutex<HashMap<u64, u8>>,
}

impl MockClassifier {
    pub fn new(default: u8) -> Arc<Self> {
        Arc::new(Self {
            default,
            state: Mutex::new(HashMap::new()),
        })
    }

    pub fn set(&self, gfn: u64, value: u8) {
        self.state.lock().insert(gfn, value);
    }
}

impl PageClassifier for MockClassifier {
    fn classify(&self, gfn: u64) -> u8 {
        self.state.lock().get(&gfn).copied().unwrap_or(self.default)
    }

    fn set_class_bits(&self, gfn: u64, mask: u8, value: u8) {
        let mut state = self.state.lock();
        let current = state.get(&gfn).copied().unwrap_or(self.default);
        state.insert(gfn, (current & !mask) | (value & mask));
    }
}

/// Sink that records every delivered event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(u32, GuestEvent)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<(u32, GuestEvent)> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl GuestEventSink for RecordingSink {
    fn deliver(&self, vp: VpIndex, event: GuestEvent) {
        self.events.lock().push((vp.index(), event));
    }
}

/// Intercept handler driven by a closure.
pub struct HandlerFn<F>(pub F);

impl<F> InterceptHandler for HandlerFn<F>
where
    F: Fn(
            VpIndex,
            InterceptCode,
            &mut ExecutionControlBlock,
            &mut GuestRegisters,
        ) -> Result<InterceptDisposition, Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
{
    fn handle_intercept(
        &self,
        vp: VpIndex,
        code: InterceptCode,
        scb: &mut ExecutionControlBlock,
        regs: &mut GuestRegisters,
    ) -> Result<InterceptDisposition, Box<dyn std::error::Error + Send + Sync>> {
        (self.0)(vp, code, scb, regs)
    }
}

/// Returns a handler that defers every intercept to the caller.
pub fn defer_all() -> impl InterceptHandler {
    HandlerFn(
        |_: VpIndex,
         _: InterceptCode,
         _: &mut ExecutionControlBlock,
         _: &mut GuestRegisters| Ok(InterceptDisposition::DeferToCaller),
    )
}

/// A partition wired to fresh mocks.
pub struct TestVm {
    pub partition: SiePartition,
    pub hardware: Arc<MockHardware>,
    pub pager: Arc<MockPager>,
    pub firmware: Arc<MockFirmware>,
    pub classifier: Arc<MockClassifier>,
}

pub fn test_vm() -> TestVm {
    test_vm_with(
        MockHardware::new(),
        SieConfig {
            async_teardown: true,
            ..Default::default()
        },
    )
}

pub fn test_vm_with(hardware: Arc<MockHardware>, config: SieConfig) -> TestVm {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let pager = MockPager::new();
    let firmware = MockFirmware::new();
    let classifier = MockClassifier::new(0);
    let partition = SiePartition::new(SiePartitionParams {
        hardware: hardware.clone(),
        pager: pager.clone(),
        firmware: firmware.clone(),
        classifier: classifier.clone(),
        config,
        clock_registry: None,
    });
    TestVm {
        partition,
        hardware,
        pager,
        firmware,
        classifier,
    }
}
