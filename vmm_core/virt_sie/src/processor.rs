// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-vCPU execution engine.
//!
//! Each vCPU is driven by one OS thread calling [`SieProcessor::run`] in a
//! loop. An iteration checks that the vCPU may run, services pending
//! requests, enters guest mode through the hardware seam, and dispatches
//! the exit. The hardware entry is the only step that blocks for an
//! unbounded time; everything that must interrupt it goes through a
//! request post plus a kick.

use crate::SiePartition;
use crate::SiePartitionInner;
use crate::SieVpInner;
use crate::VpIndex;
use crate::VpRunState;
use crate::clock::TimerAccounting;
use crate::hardware::EntryError;
use crate::hardware::ExitCause;
use crate::hardware::GuestFault;
use crate::memory::PagerError;
use crate::protect::FirmwareError;
use crate::protect::ProtectError;
use crate::requests::WakeReason;
use siedef::ExecutionControlBlock;
use siedef::FaultClass;
use siedef::GuestRegisters;
use siedef::InterceptCode;
use siedef::PAGE_SHIFT;
use siedef::PAGE_SIZE;
use siedef::PREFIX_PAGES;
use siedef::PREFIX_SIZE;
use siedef::ProgramCode;
use siedef::ProtectedCpuState;
use siedef::facility;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use thiserror::Error;

/// Why [`SieProcessor::run`] returned to the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum VpExit {
    /// The vCPU cannot run; resume it or lift the inhibit and call run
    /// again.
    Blocked(BlockReason),
    /// A stop request completed; the vCPU is now stopped.
    Stopped,
    /// A kick was delivered with no request pending, leaving the thread
    /// free to take a host signal.
    Interrupted,
    /// The intercept handler deferred this intercept to the caller.
    Intercept(InterceptCode),
    /// A fault was queued for asynchronous resolution and the guest was
    /// told the page is not present. Resolve the page, then call
    /// [`SiePartition::complete_async_fault`].
    AsyncFaultQueued {
        /// The faulting guest absolute address.
        gpa: u64,
    },
}

/// Why a vCPU is not allowed to run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// The run state is not operating.
    NotOperating,
    /// VM-scope work has inhibited all guest execution.
    Inhibited,
}

/// A terminal error from the run loop.
#[derive(Debug, Error)]
pub enum VpRunError {
    /// The hardware rejected the guest entry.
    #[error("hardware guest entry failed")]
    Entry(#[source] EntryError),
    /// The prefix region could not be re-validated at the given guest
    /// address.
    #[error("prefix revalidation failed at {0:#x}")]
    Prefix(u64, #[source] PagerError),
    /// A guest access fault at the given address could not be resolved.
    #[error("unresolvable guest fault at {0:#x}")]
    Fault(u64, #[source] PagerError),
    /// A page at the given address could not be imported into protected
    /// storage.
    #[error("protected import failed at {0:#x}")]
    Import(u64, #[source] ProtectError),
    /// The host mapping of a secure page at the given address could not
    /// be invalidated.
    #[error("secure invalidation failed at {0:#x}")]
    SecureInvalidate(u64, #[source] PagerError),
    /// An unrecoverable protected-storage integrity violation. The VM
    /// must be terminated.
    #[error("secure storage violation at {gpa:#x}")]
    SecureStorageViolation {
        /// The faulting guest absolute address.
        gpa: u64,
    },
    /// A secure-class fault arrived for a vCPU that is not protected.
    #[error("unexpected secure fault at {gpa:#x}")]
    UnexpectedSecureFault {
        /// The faulting guest absolute address.
        gpa: u64,
    },
    /// The intercept handler failed.
    #[error("intercept {0:?} handling failed")]
    Intercept(InterceptCode, #[source] Box<dyn std::error::Error + Send + Sync>),
}

/// An error changing a vCPU's run state.
#[derive(Debug, Error)]
pub enum VpStateError {
    /// No vCPU with this index exists.
    #[error("no such vcpu")]
    NotFound,
    /// The load state is only reachable under protected execution.
    #[error("load state requires protected execution")]
    InvalidState,
    /// The firmware rejected the run-state change.
    #[error("firmware rejected the run-state change")]
    Firmware(#[source] FirmwareError),
}

/// Outcome of intercept handling.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InterceptDisposition {
    /// Handled; resume the guest.
    Continue,
    /// Return the intercept to the caller, e.g. for userspace emulation.
    DeferToCaller,
}

/// The intercept-handling collaborator: instruction completion, interrupt
/// delivery decisions, and anything else keyed off an intercept code.
pub trait InterceptHandler: Send + Sync {
    /// Handles one intercept. The control block and register mirror are
    /// the live copies for the next entry.
    fn handle_intercept(
        &self,
        vp: VpIndex,
        code: InterceptCode,
        scb: &mut ExecutionControlBlock,
        regs: &mut GuestRegisters,
    ) -> Result<InterceptDisposition, Box<dyn std::error::Error + Send + Sync>>;
}

/// Guest-visible events the engine injects through the interrupt
/// controller collaborator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GuestEvent {
    /// A recoverable machine check taken while the guest was running.
    MachineCheck {
        /// The machine-check interruption code.
        code: u64,
    },
    /// A program interruption.
    Program(ProgramCode),
    /// The page a fault notification was armed for is not yet present.
    FaultNotPresent {
        /// The guest-supplied correlation token.
        token: u64,
    },
    /// A previously not-present page is now present.
    FaultPresent {
        /// The guest-supplied correlation token.
        token: u64,
    },
}

/// The interrupt-controller collaborator.
///
/// The engine only decides that an event must reach the guest; queueing
/// and architectural delivery are outside this crate.
pub trait GuestEventSink: Send + Sync {
    /// Queues `event` for delivery to `vp`.
    fn deliver(&self, vp: VpIndex, event: GuestEvent);
}

/// The execution engine for one vCPU, owned by the thread that runs it.
pub struct SieProcessor {
    partition: Arc<SiePartitionInner>,
    vp: Arc<SieVpInner>,
    scb: Box<ExecutionControlBlock>,
    regs: GuestRegisters,
    timer: TimerAccounting,
}

impl SieProcessor {
    pub(crate) fn new(
        partition: Arc<SiePartitionInner>,
        vp: Arc<SieVpInner>,
        scb: Box<ExecutionControlBlock>,
    ) -> Self {
        Self {
            partition,
            vp,
            scb,
            regs: GuestRegisters::new(),
            timer: TimerAccounting::new(),
        }
    }

    /// Returns this vCPU's index.
    pub fn index(&self) -> VpIndex {
        self.vp.index
    }

    /// Returns the live register mirror.
    pub fn registers(&mut self) -> &mut GuestRegisters {
        &mut self.regs
    }

    /// Returns the live control block, for save/restore under
    /// [`SiePartition::block_execution`].
    pub fn control_block(&mut self) -> &mut ExecutionControlBlock {
        &mut self.scb
    }

    /// Starts this vCPU.
    pub fn start(&self) -> Result<(), VpStateError> {
        self.partition.start_vp(&self.vp)
    }

    /// Stops this vCPU.
    pub fn stop(&self) {
        self.partition.stop_vp(&self.vp)
    }

    /// Returns the current run state.
    pub fn run_state(&self) -> VpRunState {
        self.vp.run_state()
    }

    /// Transitions the run state to `target`.
    pub fn set_run_state(&self, target: VpRunState) -> Result<(), VpStateError> {
        self.partition.set_vp_run_state(&self.vp, target)
    }

    /// Moves the vCPU's prefix region. The base is aligned down to the
    /// region size and revalidated before the next guest entry.
    pub fn set_prefix(&mut self, base: u64) {
        let base = base & !(PREFIX_SIZE - 1);
        *self.vp.prefix.write() = base;
        self.vp.wake.post(WakeReason::REFRESH_PREFIX);
        tracing::debug!(vp = self.vp.index.index(), base, "prefix moved");
    }

    /// Returns the current prefix base.
    pub fn prefix(&self) -> u64 {
        *self.vp.prefix.read()
    }

    /// Arms asynchronous fault notifications with the guest-supplied
    /// correlation token.
    pub fn arm_async_faults(&mut self, token: u64) {
        self.vp.async_fault.lock().armed = Some(token);
    }

    /// Disarms asynchronous fault notifications. Faults queued but not
    /// yet completed will complete silently.
    pub fn disarm_async_faults(&mut self) {
        self.vp.async_fault.lock().armed = None;
    }

    /// Runs the vCPU until a caller-visible exit.
    pub fn run(
        &mut self,
        handler: &impl InterceptHandler,
        sink: &impl GuestEventSink,
    ) -> Result<VpExit, VpRunError> {
        loop {
            if let Some(exit) = self.preflight() {
                return Ok(exit);
            }
            if let Some(exit) = self.service_requests()? {
                return Ok(exit);
            }
            let Some(cause) = self.enter_guest()? else {
                // Backed out of the entry; service what arrived.
                continue;
            };
            if let Some(exit) = self.dispatch_exit(cause, handler, sink)? {
                return Ok(exit);
            }
        }
    }

    fn preflight(&mut self) -> Option<VpExit> {
        let vp = &self.vp;
        if vp.blocks.load(Ordering::SeqCst) > 0 {
            let mut parked = vp.park.lock();
            while vp.blocks.load(Ordering::SeqCst) > 0 {
                vp.unparked.wait(&mut parked);
            }
        }
        if self.partition.inhibited.load(Ordering::SeqCst) {
            return Some(VpExit::Blocked(BlockReason::Inhibited));
        }
        if vp.run_state() != VpRunState::Operating {
            return Some(VpExit::Blocked(BlockReason::NotOperating));
        }
        None
    }

    /// Drains and services requests until none are pending. A handler may
    /// post further requests; they are picked up before returning.
    fn service_requests(&mut self) -> Result<Option<VpExit>, VpRunError> {
        loop {
            let pending = self.vp.wake.drain();
            if pending.is_empty() {
                return Ok(None);
            }
            if pending.tlb_flush() {
                self.scb.controls.set_flush_tlb(true);
            }
            if pending.refresh_prefix() {
                self.refresh_prefix()?;
            }
            if pending.enable_ibs() {
                self.scb.controls.set_interpretation_buffering(true);
                tracing::debug!(
                    vp = self.vp.index.index(),
                    "interpretation buffering enabled"
                );
            }
            if pending.disable_ibs() {
                self.scb.controls.set_interpretation_buffering(false);
                tracing::debug!(
                    vp = self.vp.index.index(),
                    "interpretation buffering disabled"
                );
            }
            if pending.migration_on() {
                // Classification updates must intercept while migration
                // is collecting them.
                self.scb.controls.set_classification_assist(false);
            }
            if pending.migration_off()
                && self
                    .partition
                    .model
                    .read()
                    .facilities
                    .is_set(facility::CLASSIFICATION_ASSIST)
            {
                self.scb.controls.set_classification_assist(true);
            }
            if pending.restart_nested() {
                tracing::debug!(
                    vp = self.vp.index.index(),
                    "nested interpretation restart"
                );
            }
            if pending.stop() {
                self.partition.stop_vp(&self.vp);
                return Ok(Some(VpExit::Stopped));
            }
        }
    }

    /// Re-validates the two-page prefix mapping, retrying one transient
    /// race per page.
    fn refresh_prefix(&mut self) -> Result<(), VpRunError> {
        let base = *self.vp.prefix.read();
        for page in 0..PREFIX_PAGES {
            let gpa = base + page * PAGE_SIZE;
            match self
                .partition
                .pager
                .resolve_fault(self.vp.index, gpa, true, true)
            {
                Ok(()) => {}
                Err(PagerError::Transient) => {
                    self.partition
                        .pager
                        .resolve_fault(self.vp.index, gpa, true, true)
                        .map_err(|err| VpRunError::Prefix(gpa, err))?;
                }
                Err(err) => return Err(VpRunError::Prefix(gpa, err)),
            }
        }
        self.scb.prefix = base;
        Ok(())
    }

    /// Enters guest mode once. Returns `None` if the entry was abandoned
    /// because a request or block arrived first.
    fn enter_guest(&mut self) -> Result<Option<ExitCause>, VpRunError> {
        {
            let epoch = *self.vp.epoch.lock();
            self.scb.epoch = epoch.base;
            self.scb.epoch_index = epoch.index;
        }
        self.scb
            .controls
            .set_protected(self.partition.protected.load(Ordering::SeqCst));
        self.scb
            .controls
            .set_async_fault(self.vp.async_fault.lock().armed.is_some());

        let vp = &self.vp;
        vp.in_guest.store(true, Ordering::SeqCst);
        // Pairs with post(): a poster either sees in_guest and kicks, or
        // posted early enough for this check to see the request.
        if !vp.wake.peek().is_empty() || vp.blocks.load(Ordering::SeqCst) > 0 {
            vp.in_guest.store(false, Ordering::SeqCst);
            return Ok(None);
        }
        let entered = self.partition.hardware.wall_clock();
        self.timer.suspend(entered);
        let result = self
            .partition
            .hardware
            .run_guest(vp.index, &mut self.scb, &mut self.regs);
        vp.in_guest.store(false, Ordering::SeqCst);
        let left = self.partition.hardware.wall_clock();
        self.timer.resume(left, &mut self.scb);
        Ok(Some(result.map_err(VpRunError::Entry)?))
    }

    fn dispatch_exit(
        &mut self,
        cause: ExitCause,
        handler: &impl InterceptHandler,
        sink: &impl GuestEventSink,
    ) -> Result<Option<VpExit>, VpRunError> {
        match cause {
            ExitCause::Interrupted => {
                // With work pending the interruption was for us; loop and
                // service it. Otherwise surface so the thread can take a
                // host signal.
                if self.vp.wake.peek().is_empty()
                    && self.vp.blocks.load(Ordering::SeqCst) == 0
                {
                    Ok(Some(VpExit::Interrupted))
                } else {
                    Ok(None)
                }
            }
            ExitCause::MachineCheck { code } => {
                sink.deliver(self.vp.index, GuestEvent::MachineCheck { code });
                Ok(None)
            }
            ExitCause::Intercept(code) => {
                match handler.handle_intercept(self.vp.index, code, &mut self.scb, &mut self.regs)
                {
                    Ok(InterceptDisposition::Continue) => Ok(None),
                    Ok(InterceptDisposition::DeferToCaller) => Ok(Some(VpExit::Intercept(code))),
                    Err(err) => Err(VpRunError::Intercept(code, err)),
                }
            }
            ExitCause::Fault(fault) => self.dispatch_fault(fault, sink),
        }
    }

    fn dispatch_fault(
        &mut self,
        fault: GuestFault,
        sink: &impl GuestEventSink,
    ) -> Result<Option<VpExit>, VpRunError> {
        let GuestFault { gpa, write, class } = fault;
        match class {
            FaultClass::Translation => self.resolve_translation_fault(gpa, write, sink),
            FaultClass::NonSecureStorage => {
                // A protected guest touched a page not yet imported into
                // protected storage.
                match self.partition.import_protected_page(gpa) {
                    Ok(()) => Ok(None),
                    Err(ProtectError::NotProtected) => {
                        Err(VpRunError::UnexpectedSecureFault { gpa })
                    }
                    Err(err) => Err(VpRunError::Import(gpa, err)),
                }
            }
            FaultClass::SecureStorageAccess => {
                // The host still holds a mapping of a page that moved to
                // protected storage; drop it and retry.
                self.partition
                    .pager
                    .invalidate_secure(gpa)
                    .map_err(|err| VpRunError::SecureInvalidate(gpa, err))?;
                Ok(None)
            }
            FaultClass::SecureStorageViolation => {
                Err(VpRunError::SecureStorageViolation { gpa })
            }
        }
    }

    fn resolve_translation_fault(
        &mut self,
        gpa: u64,
        write: bool,
        sink: &impl GuestEventSink,
    ) -> Result<Option<VpExit>, VpRunError> {
        if !self.partition.gpa_registered(gpa) {
            // An access outside registered memory is the guest's own
            // error; inject it and keep running.
            sink.deliver(self.vp.index, GuestEvent::Program(ProgramCode::ADDRESSING));
            return Ok(None);
        }
        let armed = self.vp.async_fault.lock().armed;
        if let Some(token) = armed {
            match self
                .partition
                .pager
                .resolve_fault(self.vp.index, gpa, write, false)
            {
                Ok(()) => return Ok(None),
                Err(PagerError::WouldBlock) => {
                    // The guest may have disarmed notifications while the
                    // non-blocking attempt ran; deliver only if still
                    // armed, otherwise fall back to a blocking resolve.
                    let mut state = self.vp.async_fault.lock();
                    if state.armed == Some(token) {
                        state.pending += 1;
                        drop(state);
                        sink.deliver(self.vp.index, GuestEvent::FaultNotPresent { token });
                        return Ok(Some(VpExit::AsyncFaultQueued { gpa }));
                    }
                }
                Err(PagerError::Transient) => {}
                Err(err) => return Err(VpRunError::Fault(gpa, err)),
            }
        }
        match self
            .partition
            .pager
            .resolve_fault(self.vp.index, gpa, write, true)
        {
            Ok(()) => Ok(None),
            Err(PagerError::Transient) => {
                // One retry; if the race persists the guest just faults
                // again on the next entry.
                match self
                    .partition
                    .pager
                    .resolve_fault(self.vp.index, gpa, write, true)
                {
                    Ok(()) | Err(PagerError::Transient) => Ok(None),
                    Err(err) => Err(VpRunError::Fault(gpa, err)),
                }
            }
            Err(err) => Err(VpRunError::Fault(gpa, err)),
        }
    }
}

impl SiePartition {
    /// Starts the vCPU at `index`.
    pub fn start_vp(&self, index: VpIndex) -> Result<(), VpStateError> {
        let vp = self.inner.vp(index).ok_or(VpStateError::NotFound)?;
        self.inner.start_vp(&vp)
    }

    /// Stops the vCPU at `index`, synchronously.
    pub fn stop_vp(&self, index: VpIndex) -> Result<(), VpStateError> {
        let vp = self.inner.vp(index).ok_or(VpStateError::NotFound)?;
        self.inner.stop_vp(&vp);
        Ok(())
    }

    /// Asks the vCPU at `index` to stop itself: its run loop observes the
    /// request and returns [`VpExit::Stopped`].
    pub fn request_stop_vp(&self, index: VpIndex) -> Result<(), VpStateError> {
        let vp = self.inner.vp(index).ok_or(VpStateError::NotFound)?;
        self.inner.post(&vp, WakeReason::STOP);
        Ok(())
    }

    /// Returns the run state of the vCPU at `index`.
    pub fn vp_run_state(&self, index: VpIndex) -> Option<VpRunState> {
        Some(self.inner.vp(index)?.run_state())
    }

    /// Transitions the vCPU at `index` to `target`.
    pub fn set_vp_run_state(&self, index: VpIndex, target: VpRunState) -> Result<(), VpStateError> {
        let vp = self.inner.vp(index).ok_or(VpStateError::NotFound)?;
        self.inner.set_vp_run_state(&vp, target)
    }

    /// Completes one queued asynchronous fault for `vp` after its page
    /// has been resolved, delivering the page-present notification.
    ///
    /// Returns false if nothing was queued or the guest disarmed
    /// notifications in the meantime.
    pub fn complete_async_fault(&self, vp: VpIndex, sink: &dyn GuestEventSink) -> bool {
        let Some(vp) = self.inner.vp(vp) else {
            return false;
        };
        let mut state = vp.async_fault.lock();
        if state.pending == 0 {
            return false;
        }
        state.pending -= 1;
        let Some(token) = state.armed else {
            return false;
        };
        drop(state);
        sink.deliver(vp.index, GuestEvent::FaultPresent { token });
        self.inner.hardware.kick(vp.index);
        true
    }
}

impl SiePartitionInner {
    pub(crate) fn start_vp(&self, vp: &SieVpInner) -> Result<(), VpStateError> {
        let _vm = self.vm.lock();
        self.start_vp_locked(vp)
    }

    fn start_vp_locked(&self, vp: &SieVpInner) -> Result<(), VpStateError> {
        if vp.run_state() == VpRunState::Operating {
            return Ok(());
        }
        // Firmware is the authority for a protected vCPU; mirror first so
        // a rejection leaves the state unchanged.
        if let Some(handle) = &*vp.protection.lock() {
            self.firmware
                .set_cpu_state(handle, ProtectedCpuState::Operating)
                .map_err(VpStateError::Firmware)?;
        }
        let operating_before = self.count_operating();
        if operating_before == 0 {
            // Sole runner: buffering speeds it up.
            if self.ibs_available() {
                self.post_ibs(vp, true);
            }
        } else if operating_before == 1 {
            // A second runner makes buffering invalid everywhere,
            // including any enable still in flight.
            for other in self.vps.read().iter() {
                self.post_ibs(other, false);
            }
        }
        vp.set_run_state(VpRunState::Operating);
        // The vCPU may have gone stale while offline.
        self.post(vp, WakeReason::TLB_FLUSH);
        tracing::debug!(vp = vp.index.index(), "vcpu started");
        Ok(())
    }

    pub(crate) fn stop_vp(&self, vp: &SieVpInner) {
        let _vm = self.vm.lock();
        self.stop_vp_locked(vp);
    }

    fn stop_vp_locked(&self, vp: &SieVpInner) {
        if vp.run_state() == VpRunState::Stopped {
            return;
        }
        // Stopped must be visible before the pending stop notification is
        // cleared so a concurrent query sees a consistent view.
        vp.set_run_state(VpRunState::Stopped);
        vp.wake.clear(WakeReason::STOP);
        if let Some(handle) = &*vp.protection.lock() {
            if let Err(err) = self
                .firmware
                .set_cpu_state(handle, ProtectedCpuState::Stopped)
            {
                tracing::warn!(
                    vp = vp.index.index(),
                    error = &err as &dyn std::error::Error,
                    "firmware stop mirror failed"
                );
            }
        }
        self.post_ibs(vp, false);
        if self.ibs_available() {
            let vps = self.vps.read();
            let mut operating = vps.iter().filter(|v| v.run_state() == VpRunState::Operating);
            if let (Some(last), None) = (operating.next(), operating.next()) {
                self.post_ibs(last, true);
            }
        }
        tracing::debug!(vp = vp.index.index(), "vcpu stopped");
    }

    pub(crate) fn set_vp_run_state(
        &self,
        vp: &SieVpInner,
        target: VpRunState,
    ) -> Result<(), VpStateError> {
        match target {
            VpRunState::Operating => self.start_vp(vp),
            VpRunState::Stopped => {
                self.stop_vp(vp);
                Ok(())
            }
            VpRunState::Load => {
                let _vm = self.vm.lock();
                if vp.run_state() == VpRunState::Operating {
                    self.stop_vp_locked(vp);
                }
                let protection = vp.protection.lock();
                let Some(handle) = &*protection else {
                    return Err(VpStateError::InvalidState);
                };
                self.firmware
                    .set_cpu_state(handle, ProtectedCpuState::Load)
                    .map_err(VpStateError::Firmware)?;
                vp.set_run_state(VpRunState::Load);
                Ok(())
            }
        }
    }

    fn count_operating(&self) -> usize {
        self.vps
            .read()
            .iter()
            .filter(|vp| vp.run_state() == VpRunState::Operating)
            .count()
    }

    fn ibs_available(&self) -> bool {
        self.model
            .read()
            .facilities
            .is_set(facility::INTERPRETATION_BUFFERING)
    }

    /// Posts a buffering change to `vp`, cancelling any opposite request
    /// still pending. Callers hold the VM lock, so the last post wins even
    /// when the vCPU has not drained between run-state transitions.
    fn post_ibs(&self, vp: &SieVpInner, enable: bool) {
        let (cancel, request) = if enable {
            (WakeReason::DISABLE_IBS, WakeReason::ENABLE_IBS)
        } else {
            (WakeReason::ENABLE_IBS, WakeReason::DISABLE_IBS)
        };
        vp.wake.clear(cancel);
        self.post(vp, request);
    }

    pub(crate) fn gpa_registered(&self, gpa: u64) -> bool {
        self.memory.lock().slot_for(gpa >> PAGE_SHIFT).is_some()
    }
}
