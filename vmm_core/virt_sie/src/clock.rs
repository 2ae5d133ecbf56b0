// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest wall-clock management.
//!
//! Every vCPU of a VM observes the same virtual time of day: the hardware
//! wall clock plus a per-VM epoch offset. The epoch is a 64-bit two's
//! complement value with an 8-bit extension index that absorbs carries and
//! borrows when the base wraps, so the combined 72-bit value is what guest
//! arithmetic sees. Epoch updates are applied to every vCPU's control-block
//! copy under the VM's block bracket so no vCPU can observe a torn value.

use crate::SiePartition;
use crate::SiePartitionInner;
use parking_lot::Mutex;
use siedef::ExecutionControlBlock;
use siedef::facility;
use std::sync::Arc;
use std::sync::Weak;

/// A point of the extended wall clock: the 64-bit base and the 8-bit
/// extension index above it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Tod {
    /// The 64-bit clock base.
    pub base: u64,
    /// The extension index holding the bits above the base.
    pub index: u8,
}

/// A guest clock epoch: the offset added to the hardware wall clock, in
/// the same extended format as [`Tod`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Epoch {
    pub base: u64,
    pub index: u8,
}

impl Epoch {
    pub const ZERO: Self = Self { base: 0, index: 0 };
}

/// Computes the epoch that makes the guest clock read `desired` when the
/// hardware clock reads `now`, borrowing from the extension index when the
/// base subtraction wraps. Without the epoch-extension facility the index
/// is pinned to zero.
pub(crate) fn epoch_for(desired: Tod, now: u64, extended: bool) -> Epoch {
    let base = desired.base.wrapping_sub(now);
    if !extended {
        return Epoch { base, index: 0 };
    }
    let borrow = (desired.base < now) as u8;
    Epoch {
        base,
        index: desired.index.wrapping_sub(borrow),
    }
}

/// Computes the guest clock for a hardware clock of `now`, carrying into
/// the extension index when the base addition wraps.
pub(crate) fn guest_tod(now: u64, epoch: Epoch, extended: bool) -> Tod {
    let base = now.wrapping_add(epoch.base);
    if !extended {
        return Tod { base, index: 0 };
    }
    let carry = (base < now) as u8;
    Tod {
        base,
        index: epoch.index.wrapping_add(carry),
    }
}

/// Adds `delta` to an epoch. The extension index moves exactly when the
/// base wraps: sign-extension of the delta plus the carry out of the base.
pub(crate) fn apply_delta(epoch: Epoch, delta: i64, extended: bool) -> Epoch {
    let base = epoch.base.wrapping_add(delta as u64);
    if !extended {
        return Epoch { base, index: 0 };
    }
    let carry = (base < epoch.base) as u8;
    let sign = if delta < 0 { 0xff } else { 0 };
    Epoch {
        base,
        index: epoch.index.wrapping_add(sign).wrapping_add(carry),
    }
}

/// Lazy guest CPU-timer accounting across a hardware entry.
///
/// The guest CPU timer counts down while the guest runs. Host-side
/// accounting stops when the hardware takes over at entry and resumes at
/// exit, charging the elapsed wall-clock time to the timer in one step.
#[derive(Debug)]
pub(crate) struct TimerAccounting {
    entered: Option<u64>,
}

impl TimerAccounting {
    pub fn new() -> Self {
        Self { entered: None }
    }

    /// Stops host accounting; the hardware owns the timer until
    /// [`Self::resume`].
    pub fn suspend(&mut self, now: u64) {
        self.entered = Some(now);
    }

    /// Resumes host accounting, charging the elapsed time to the guest
    /// timer.
    pub fn resume(&mut self, now: u64, scb: &mut ExecutionControlBlock) {
        if let Some(entered) = self.entered.take() {
            scb.cpu_timer = scb.cpu_timer.wrapping_sub(now.wrapping_sub(entered));
        }
    }
}

/// Registry of partitions interested in host clock steps.
///
/// The embedder constructs one registry, hands it to each partition at
/// creation, and calls [`Self::on_host_clock_step`] from its clock-change
/// notifier. Partitions deregister when dropped.
pub struct HostClockRegistry {
    vms: Mutex<Vec<Weak<SiePartitionInner>>>,
}

impl HostClockRegistry {
    /// Returns an empty registry.
    pub fn new() -> Self {
        Self {
            vms: Mutex::new(Vec::new()),
        }
    }

    /// Compensates every registered VM for a host clock step of `delta`,
    /// adding the negated delta to each VM's and each vCPU's epoch so
    /// guest-observed time is unaffected.
    pub fn on_host_clock_step(&self, delta: i64) {
        let vms: Vec<Arc<SiePartitionInner>> = {
            let mut list = self.vms.lock();
            list.retain(|vm| vm.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };
        for vm in &vms {
            vm.apply_host_clock_step(delta);
        }
        tracing::debug!(delta, vms = vms.len(), "host clock step applied");
    }

    pub(crate) fn register(&self, vm: &Arc<SiePartitionInner>) {
        self.vms.lock().push(Arc::downgrade(vm));
    }

    pub(crate) fn deregister(&self, vm: &SiePartitionInner) {
        self.vms
            .lock()
            .retain(|w| !std::ptr::eq(w.as_ptr(), vm));
    }
}

impl SiePartition {
    /// Sets the guest wall clock to `desired`.
    ///
    /// The new epoch is written to every vCPU's control-block copy under
    /// the block bracket, so no vCPU observes a torn value.
    pub fn set_clock(&self, desired: Tod) {
        self.inner.set_clock(desired);
    }

    /// Returns the current guest wall clock.
    pub fn get_clock(&self) -> Tod {
        self.inner.get_clock()
    }
}

impl SiePartitionInner {
    fn epoch_extended(&self) -> bool {
        self.model
            .read()
            .facilities
            .is_set(facility::EPOCH_EXTENSION)
    }

    pub(crate) fn set_clock(&self, desired: Tod) {
        let mut vm = self.vm.lock();
        let extended = self.epoch_extended();
        let now = self.hardware.wall_clock();
        let epoch = epoch_for(desired, now, extended);
        let _blocked = self.block_all_vps();
        vm.epoch = epoch;
        for vp in self.vps.read().iter() {
            *vp.epoch.lock() = epoch;
        }
        tracing::debug!(base = epoch.base, index = epoch.index, "guest wall clock set");
    }

    pub(crate) fn get_clock(&self) -> Tod {
        let vm = self.vm.lock();
        guest_tod(self.hardware.wall_clock(), vm.epoch, self.epoch_extended())
    }

    pub(crate) fn apply_host_clock_step(&self, delta: i64) {
        let mut vm = self.vm.lock();
        let extended = self.epoch_extended();
        let step = delta.wrapping_neg();
        let _blocked = self.block_all_vps();
        vm.epoch = apply_delta(vm.epoch, step, extended);
        for vp in self.vps.read().iter() {
            let mut epoch = vp.epoch.lock();
            *epoch = apply_delta(*epoch, step, extended);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Epoch;
    use super::Tod;
    use super::apply_delta;
    use super::epoch_for;
    use super::guest_tod;

    #[test]
    fn epoch_borrows_on_wrap() {
        // Guest behind the host: the base subtraction wraps and borrows.
        let epoch = epoch_for(Tod { base: 95, index: 0 }, 100, true);
        assert_eq!(epoch.base, 95u64.wrapping_sub(100));
        assert_eq!(epoch.index, 0xff);
        // Guest ahead of the host: no borrow.
        let epoch = epoch_for(Tod { base: 200, index: 3 }, 100, true);
        assert_eq!(epoch.base, 100);
        assert_eq!(epoch.index, 3);
    }

    #[test]
    fn guest_tod_carries_on_wrap() {
        // A negative epoch wraps the addition; the carry cancels the
        // sign-extended index.
        let epoch = epoch_for(Tod { base: 95, index: 0 }, 100, true);
        let tod = guest_tod(100, epoch, true);
        assert_eq!(tod, Tod { base: 95, index: 0 });
        let tod = guest_tod(200, epoch, true);
        assert_eq!(tod, Tod { base: 195, index: 0 });
    }

    #[test]
    fn set_then_get_roundtrips_across_the_index() {
        for &(base, index) in &[
            (0u64, 0u8),
            (u64::MAX, 0),
            (5, 1),
            (u64::MAX - 3, 0xff),
        ] {
            let desired = Tod { base, index };
            for &now in &[0u64, 1, 1 << 63, u64::MAX] {
                let epoch = epoch_for(desired, now, true);
                assert_eq!(guest_tod(now, epoch, true), desired, "now={now:#x}");
            }
        }
    }

    #[test]
    fn delta_moves_the_index_exactly_on_wrap() {
        let epoch = Epoch { base: 5, index: 7 };
        // Negative delta that wraps the base borrows from the index.
        let stepped = apply_delta(epoch, -10, true);
        assert_eq!(stepped.base, 5u64.wrapping_sub(10));
        assert_eq!(stepped.index, 6);
        // Negative delta without a wrap leaves the index alone.
        let stepped = apply_delta(Epoch { base: 100, index: 7 }, -10, true);
        assert_eq!(stepped.base, 90);
        assert_eq!(stepped.index, 7);
        // Positive delta that wraps the base carries into the index.
        let stepped = apply_delta(Epoch { base: u64::MAX - 2, index: 7 }, 5, true);
        assert_eq!(stepped.base, 2);
        assert_eq!(stepped.index, 8);
        // Positive delta without a wrap leaves the index alone.
        let stepped = apply_delta(Epoch { base: 1, index: 7 }, 5, true);
        assert_eq!(stepped.base, 6);
        assert_eq!(stepped.index, 7);
    }

    #[test]
    fn without_the_facility_the_index_is_pinned() {
        let epoch = epoch_for(Tod { base: 0, index: 9 }, 100, false);
        assert_eq!(epoch.index, 0);
        let stepped = apply_delta(Epoch { base: 5, index: 0 }, -10, false);
        assert_eq!(stepped.index, 0);
        let tod = guest_tod(100, Epoch { base: u64::MAX, index: 0 }, false);
        assert_eq!(tod.index, 0);
    }
}
