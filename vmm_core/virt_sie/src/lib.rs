// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The hardware-assisted interpretive-execution engine.
//!
//! This crate owns the lifecycle of a VM and its vCPUs on hardware whose
//! guest-entry instruction runs a guest until an intercept: control-block
//! construction, the per-vCPU run loop, the request/kick protocol that
//! interrupts guest mode, guest wall-clock epochs, CPU model negotiation,
//! protected (confidential) execution transitions, and dirty-page tracking
//! for live migration.
//!
//! The engine deliberately does not own memory contents, interrupt
//! queueing, or instruction emulation. Those arrive through collaborator
//! traits: [`SieHardware`] for the entry instruction and kicks,
//! [`GuestPager`] for host-side mappings, [`ProtectionFirmware`] for the
//! confidential-execution firmware, [`PageClassifier`] for page-usage
//! state, and per-run [`InterceptHandler`] and [`GuestEventSink`] for
//! emulation and event delivery.

#![forbid(unsafe_code)]

mod clock;
mod cpu_model;
mod dirty;
mod hardware;
mod memory;
mod processor;
mod protect;
mod requests;

pub use clock::HostClockRegistry;
pub use clock::Tod;
pub use cpu_model::CpuModel;
pub use cpu_model::CpuModelError;
pub use cpu_model::HostCapabilities;
pub use dirty::DirtyBatch;
pub use dirty::DirtyLogError;
pub use dirty::MigrationError;
pub use dirty::MigrationStatus;
pub use dirty::PageClassifier;
pub use dirty::USAGE_CLASS_MASK;
pub use hardware::CpuIdentity;
pub use hardware::EntryError;
pub use hardware::ExitCause;
pub use hardware::GuestFault;
pub use hardware::SieHardware;
pub use memory::AddressRange;
pub use memory::GuestPager;
pub use memory::MemoryInvalidateClient;
pub use memory::MemorySlotError;
pub use memory::PagerError;
pub use processor::BlockReason;
pub use processor::GuestEvent;
pub use processor::GuestEventSink;
pub use processor::InterceptDisposition;
pub use processor::InterceptHandler;
pub use processor::SieProcessor;
pub use processor::VpExit;
pub use processor::VpRunError;
pub use processor::VpStateError;
pub use protect::CpuProtectionHandle;
pub use protect::FirmwareError;
pub use protect::ProtectError;
pub use protect::ProtectionFirmware;
pub use protect::ProtectionMode;
pub use protect::ProtectionStatus;
pub use protect::VmProtectionHandle;

use crate::clock::Epoch;
use crate::memory::MemoryState;
use crate::protect::ParkedTeardown;
use crate::protect::ProtectionState;
use crate::protect::run_teardown;
use crate::requests::RequestSet;
use crate::requests::WakeReason;
use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use parking_lot::RwLock;
use siedef::CpuTableFormat;
use siedef::EXTENDED_CPU_SLOTS;
use siedef::ExecutionControlBlock;
use siedef::PAGE_SIZE;
use siedef::facility;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use thiserror::Error;

/// The index of a vCPU within its VM.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VpIndex(u32);

impl VpIndex {
    /// The index of the bootstrap vCPU.
    pub const BSP: Self = Self::new(0);

    /// Returns the index wrapping `index`.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the numeric index.
    pub const fn index(&self) -> u32 {
        self.0
    }

    /// Returns whether this is the bootstrap vCPU.
    pub fn is_bsp(&self) -> bool {
        self.0 == 0
    }
}

/// Run state of a vCPU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum VpRunState {
    /// Not executing. Requests accumulate until the vCPU is started.
    Stopped = 0,
    /// Eligible to enter guest mode.
    Operating = 1,
    /// Stopped while firmware loads its state; only reachable under
    /// protected execution.
    Load = 2,
}

/// Static configuration of a partition.
#[derive(Debug, Clone)]
pub struct SieConfig {
    /// Largest vCPU index the embedder will create, plus one.
    pub max_vps: u32,
    /// Whether protected teardowns may be parked for asynchronous
    /// completion.
    pub async_teardown: bool,
}

impl Default for SieConfig {
    fn default() -> Self {
        Self {
            max_vps: EXTENDED_CPU_SLOTS,
            async_teardown: false,
        }
    }
}

/// Everything needed to build a partition.
pub struct SiePartitionParams {
    /// The guest-entry seam.
    pub hardware: Arc<dyn SieHardware>,
    /// The host-side mapping layer.
    pub pager: Arc<dyn GuestPager>,
    /// The protected-execution firmware.
    pub firmware: Arc<dyn ProtectionFirmware>,
    /// The page-usage classification store.
    pub classifier: Arc<dyn PageClassifier>,
    /// Static limits and toggles.
    pub config: SieConfig,
    /// Registry to notify this partition of host clock steps, if the
    /// embedder tracks them.
    pub clock_registry: Option<Arc<HostClockRegistry>>,
}

/// An error creating a vCPU.
#[derive(Debug, Error)]
pub enum VpCreateError {
    /// A vCPU with this index already exists.
    #[error("vcpu already exists")]
    Exists,
    /// The index is beyond the partition's limit.
    #[error("vcpu index beyond the partition's limit")]
    IndexOutOfRange,
    /// The index needs the extended CPU table, which the model lacks.
    #[error("extended cpu table is not available")]
    TableUnsupported,
    /// The firmware's per-CPU contexts are fixed at enable time, so a
    /// protected VM cannot grow.
    #[error("vcpus cannot be created while the vm is protected")]
    Protected,
}

/// A VM under the engine's control.
///
/// Cheap to clone; all clones refer to the same VM. Dropping the last
/// handle (including every [`SieProcessor`]) tears the VM down.
#[derive(Clone)]
pub struct SiePartition {
    pub(crate) inner: Arc<SiePartitionInner>,
}

/// VM-scope state serialized by one mutex.
pub(crate) struct VmState {
    /// The guest wall-clock epoch.
    pub epoch: Epoch,
    /// The CPU addressing-table format. Conversion to extended is one
    /// way.
    pub cpu_table: CpuTableFormat,
    /// The protected-execution lifecycle state.
    pub protection: ProtectionState,
    /// Whether interrupt sources that cannot target a protected guest
    /// are masked.
    pub service_signals_masked: bool,
}

pub(crate) struct SiePartitionInner {
    /// VM-scope mutable state. Must be held to use the block bracket.
    pub vm: Mutex<VmState>,
    /// The vCPUs, in creation order. Only grows, and only under the VM
    /// lock.
    pub vps: RwLock<Vec<Arc<SieVpInner>>>,
    /// The committed guest CPU model.
    pub model: RwLock<CpuModel>,
    /// Host capabilities probed at creation.
    pub host: HostCapabilities,
    pub hardware: Arc<dyn SieHardware>,
    pub pager: Arc<dyn GuestPager>,
    pub firmware: Arc<dyn ProtectionFirmware>,
    pub classifier: Arc<dyn PageClassifier>,
    /// The slot table and migration flag.
    pub memory: Mutex<MemoryState>,
    /// Dirty pages not yet consumed by migration.
    pub dirty_pages: AtomicU64,
    /// Mirror of the protected lifecycle state, read at every guest
    /// entry.
    pub protected: AtomicBool,
    /// Blocks all guest execution while VM-scope work (such as a dump)
    /// is in progress.
    pub inhibited: AtomicBool,
    pub config: SieConfig,
    pub clock_registry: Option<Arc<HostClockRegistry>>,
}

/// Per-vCPU state shared between its engine and the partition.
pub(crate) struct SieVpInner {
    pub index: VpIndex,
    /// Pending asynchronous requests.
    pub wake: RequestSet,
    /// True while the vCPU thread is committed to or inside a hardware
    /// entry.
    pub in_guest: AtomicBool,
    /// Active block brackets. The vCPU parks while nonzero.
    pub blocks: AtomicU32,
    pub park: Mutex<()>,
    pub unparked: Condvar,
    run_state: AtomicU8,
    /// This vCPU's copy of the clock epoch, mirrored into the control
    /// block at entry.
    pub epoch: Mutex<Epoch>,
    /// Base of the prefix region.
    pub prefix: RwLock<u64>,
    /// Firmware handle while the VM is protected.
    pub protection: Mutex<Option<CpuProtectionHandle>>,
    pub async_fault: Mutex<AsyncFaultState>,
}

#[derive(Debug, Default)]
pub(crate) struct AsyncFaultState {
    /// Correlation token for fault notifications, when armed.
    pub armed: Option<u64>,
    /// Faults reported not-present and not yet completed.
    pub pending: u32,
}

impl SieVpInner {
    pub fn run_state(&self) -> VpRunState {
        match self.run_state.load(Ordering::SeqCst) {
            x if x == VpRunState::Operating as u8 => VpRunState::Operating,
            x if x == VpRunState::Load as u8 => VpRunState::Load,
            _ => VpRunState::Stopped,
        }
    }

    pub fn set_run_state(&self, state: VpRunState) {
        self.run_state.store(state as u8, Ordering::SeqCst);
    }
}

impl SiePartition {
    /// Builds a partition from its collaborators.
    ///
    /// The guest CPU model starts as the full host model; replace it with
    /// [`Self::set_cpu_model`] before creating vCPUs.
    pub fn new(params: SiePartitionParams) -> Self {
        let SiePartitionParams {
            hardware,
            pager,
            firmware,
            classifier,
            config,
            clock_registry,
        } = params;
        let host = HostCapabilities::probe(hardware.as_ref());
        let model = CpuModel::from_host(&host);
        let inner = Arc::new(SiePartitionInner {
            vm: Mutex::new(VmState {
                epoch: Epoch::ZERO,
                cpu_table: CpuTableFormat::Basic,
                protection: ProtectionState::Unprotected,
                service_signals_masked: false,
            }),
            vps: RwLock::new(Vec::new()),
            model: RwLock::new(model),
            host,
            hardware,
            pager,
            firmware,
            classifier,
            memory: Mutex::new(MemoryState::new()),
            dirty_pages: AtomicU64::new(0),
            protected: AtomicBool::new(false),
            inhibited: AtomicBool::new(false),
            config,
            clock_registry,
        });
        if let Some(registry) = &inner.clock_registry {
            registry.register(&inner);
        }
        tracing::info!(
            facilities = inner.host.facilities.count_ones(),
            features = inner.host.features.count_ones(),
            "partition created"
        );
        Self { inner }
    }

    /// Creates the vCPU at `index`, returning its execution engine.
    ///
    /// The engine is meant to move to the thread that will run the vCPU;
    /// everything else about the vCPU is driven through the partition.
    pub fn create_vp(&self, index: VpIndex) -> Result<SieProcessor, VpCreateError> {
        self.inner.create_vp(index)
    }

    /// Keeps every vCPU out of guest mode until the returned bracket is
    /// dropped, for state save/restore.
    pub fn block_execution(&self) -> ExecutionBlock<'_> {
        let vm = self.inner.vm.lock();
        let blocked = self.inner.block_all_vps();
        ExecutionBlock {
            _blocked: blocked,
            _vm: vm,
        }
    }

    /// Inhibits or resumes all guest execution, e.g. while the VM is
    /// being dumped. Inhibited vCPUs return [`VpExit::Blocked`] from
    /// their run loops instead of waiting.
    pub fn set_execution_inhibited(&self, inhibited: bool) {
        self.inner.inhibited.store(inhibited, Ordering::SeqCst);
        if inhibited {
            for vp in self.inner.vps.read().iter() {
                self.inner.hardware.kick(vp.index);
            }
        }
    }

    /// Posts a TLB flush to every vCPU, applied before its next entry.
    pub fn request_tlb_flush(&self) {
        self.inner.broadcast(WakeReason::TLB_FLUSH);
    }

    /// Returns the CPU addressing-table format currently in use.
    pub fn cpu_table_format(&self) -> CpuTableFormat {
        self.inner.vm.lock().cpu_table
    }
}

/// Holds every vCPU of a partition out of guest mode.
pub struct ExecutionBlock<'a> {
    // Unblocks before the VM lock is released.
    _blocked: BlockedVps<'a>,
    _vm: MutexGuard<'a, VmState>,
}

/// Crate-internal unblock-on-drop guard. Callers hold the VM lock, which
/// keeps the vCPU list stable for the bracket's lifetime.
pub(crate) struct BlockedVps<'a> {
    inner: &'a SiePartitionInner,
}

impl Drop for BlockedVps<'_> {
    fn drop(&mut self) {
        for vp in self.inner.vps.read().iter() {
            if vp.blocks.fetch_sub(1, Ordering::SeqCst) == 1 {
                // Taking the park lock orders the notify after any
                // in-progress wait registration.
                let _parked = vp.park.lock();
                vp.unparked.notify_all();
            }
        }
    }
}

impl SiePartitionInner {
    /// Posts a request to `vp`, kicking it out of guest mode if it is
    /// there.
    pub(crate) fn post(&self, vp: &SieVpInner, reason: WakeReason) {
        if vp.wake.post(reason) && vp.in_guest.load(Ordering::SeqCst) {
            self.hardware.kick(vp.index);
        }
    }

    /// Posts a request to every vCPU.
    pub(crate) fn broadcast(&self, reason: WakeReason) {
        for vp in self.vps.read().iter() {
            self.post(vp, reason);
        }
    }

    pub(crate) fn vp(&self, index: VpIndex) -> Option<Arc<SieVpInner>> {
        self.vps.read().iter().find(|vp| vp.index == index).cloned()
    }

    /// Forces every vCPU out of guest mode and keeps it out until the
    /// guard drops. The caller must hold the VM lock.
    ///
    /// Only the hardware entry is excluded: vCPU threads may still run
    /// host-side code, so this never deadlocks with a thread waiting on
    /// the VM lock.
    pub(crate) fn block_all_vps(&self) -> BlockedVps<'_> {
        let vps = self.vps.read();
        for vp in vps.iter() {
            vp.blocks.fetch_add(1, Ordering::SeqCst);
            if vp.in_guest.load(Ordering::SeqCst) {
                self.hardware.kick(vp.index);
            }
        }
        for vp in vps.iter() {
            while vp.in_guest.load(Ordering::SeqCst) {
                std::hint::spin_loop();
            }
        }
        drop(vps);
        BlockedVps { inner: self }
    }

    /// Converts the CPU table to its extended format. One way. The caller
    /// holds the VM lock and the block bracket.
    pub(crate) fn convert_cpu_table(&self, vm: &mut VmState) {
        if vm.cpu_table == CpuTableFormat::Extended {
            return;
        }
        vm.cpu_table = CpuTableFormat::Extended;
        // Nested interpretation caches the table origin.
        if self
            .model
            .read()
            .facilities
            .is_set(facility::NESTED_INTERPRETATION)
        {
            self.broadcast(WakeReason::RESTART_NESTED);
        }
        tracing::debug!("cpu table converted to extended format");
    }

    fn create_vp(self: &Arc<Self>, index: VpIndex) -> Result<SieProcessor, VpCreateError> {
        let mut vm = self.vm.lock();
        if !matches!(vm.protection, ProtectionState::Unprotected) {
            return Err(VpCreateError::Protected);
        }
        if index.index() >= self.config.max_vps || index.index() >= EXTENDED_CPU_SLOTS {
            return Err(VpCreateError::IndexOutOfRange);
        }
        if self.vps.read().iter().any(|vp| vp.index == index) {
            return Err(VpCreateError::Exists);
        }
        if index.index() >= vm.cpu_table.cpu_slots() {
            if !self
                .model
                .read()
                .facilities
                .is_set(facility::EXTENDED_CPU_TABLE)
            {
                return Err(VpCreateError::TableUnsupported);
            }
            let _blocked = self.block_all_vps();
            self.convert_cpu_table(&mut vm);
        }

        let mut scb = Box::new(ExecutionControlBlock::new());
        {
            let model = self.model.read();
            scb.facilities.copy_from_slice(&model.facilities.0[..4]);
            scb.controls.set_classification_assist(
                model.facilities.is_set(facility::CLASSIFICATION_ASSIST)
                    && !self.memory.lock().migration,
            );
        }
        let vp = Arc::new(SieVpInner {
            index,
            wake: RequestSet::new(),
            in_guest: AtomicBool::new(false),
            blocks: AtomicU32::new(0),
            park: Mutex::new(()),
            unparked: Condvar::new(),
            run_state: AtomicU8::new(VpRunState::Stopped as u8),
            epoch: Mutex::new(vm.epoch),
            prefix: RwLock::new(0),
            protection: Mutex::new(None),
            async_fault: Mutex::new(AsyncFaultState::default()),
        });
        // A fresh vCPU validates its prefix mapping and starts with a
        // clean TLB.
        vp.wake.post(WakeReason::REFRESH_PREFIX);
        vp.wake.post(WakeReason::TLB_FLUSH);
        self.vps.write().push(vp.clone());
        drop(vm);
        tracing::debug!(vp = index.index(), "vcpu created");
        Ok(SieProcessor::new(self.clone(), vp, scb))
    }
}

impl Drop for SiePartitionInner {
    fn drop(&mut self) {
        // No vCPU thread can be live here: every engine holds a strong
        // reference to this state.
        let protection = std::mem::replace(
            &mut self.vm.get_mut().protection,
            ProtectionState::Unprotected,
        );
        let parked = match protection {
            ProtectionState::Protected { vm } => Some(ParkedTeardown {
                vm,
                cpus: self.take_cpu_handles(),
            }),
            ProtectionState::AsyncPrepared { parked } => Some(parked),
            ProtectionState::Unprotected | ProtectionState::AsyncPerforming => None,
        };
        if let Some(parked) = parked {
            if let Err(err) = run_teardown(self.firmware.as_ref(), parked) {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "protected teardown failed at vm destruction"
                );
            }
        }
        let slots = std::mem::take(&mut self.memory.get_mut().slots);
        for slot in &slots {
            self.pager
                .unmap_segment(slot.base_gfn * PAGE_SIZE, slot.pages * PAGE_SIZE);
        }
        if let Some(registry) = &self.clock_registry {
            registry.deregister(self);
        }
        tracing::debug!("partition destroyed");
    }
}
