// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-vCPU asynchronous request bus.
//!
//! Requests are sticky bits in one atomic word per vCPU. Posting is an
//! atomic OR from any thread; the owning vCPU thread drains the word with an
//! atomic swap once per run-loop iteration and services each set bit.
//! Because a kick can race with a concurrent post of the same kind, every
//! handler must tolerate being run twice for one logical request.

use bitfield_struct::bitfield;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The set of asynchronous requests a vCPU can have pending.
#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct WakeReason {
    /// Flush the guest TLB before the next hardware entry.
    pub tlb_flush: bool,
    /// Re-validate the two-page prefix mapping.
    pub refresh_prefix: bool,
    /// Enable interpretation buffering on this vCPU.
    pub enable_ibs: bool,
    /// Disable interpretation buffering on this vCPU.
    pub disable_ibs: bool,
    /// Migration mode started; disable the classification assist so
    /// usage updates intercept and can be tracked.
    pub migration_on: bool,
    /// Migration mode stopped; restore direct interpretation of
    /// classification updates.
    pub migration_off: bool,
    /// A nested interpretive-execution context must restart from its
    /// shadow state.
    pub restart_nested: bool,
    /// A stop of this vCPU was requested.
    pub stop: bool,
    #[bits(56)]
    _reserved: u64,
}

impl WakeReason {
    pub const TLB_FLUSH: Self = Self::new().with_tlb_flush(true);
    pub const REFRESH_PREFIX: Self = Self::new().with_refresh_prefix(true);
    pub const ENABLE_IBS: Self = Self::new().with_enable_ibs(true);
    pub const DISABLE_IBS: Self = Self::new().with_disable_ibs(true);
    pub const MIGRATION_ON: Self = Self::new().with_migration_on(true);
    pub const MIGRATION_OFF: Self = Self::new().with_migration_off(true);
    pub const RESTART_NESTED: Self = Self::new().with_restart_nested(true);
    pub const STOP: Self = Self::new().with_stop(true);

    /// Returns whether no request is pending.
    pub fn is_empty(&self) -> bool {
        self.into_bits() == 0
    }
}

/// The pending-request word of one vCPU.
#[derive(Debug, Default)]
pub(crate) struct RequestSet(AtomicU64);

impl RequestSet {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Posts `reason`, returning true if any of its bits was newly set.
    ///
    /// SeqCst pairs with the in-guest publication in the run loop: either
    /// the poster observes the vCPU in guest mode and kicks it, or the vCPU
    /// observes the request before committing to the entry.
    pub fn post(&self, reason: WakeReason) -> bool {
        let bits = reason.into_bits();
        self.0.fetch_or(bits, Ordering::SeqCst) & bits != bits
    }

    /// Atomically takes the entire pending set.
    pub fn drain(&self) -> WakeReason {
        WakeReason::from_bits(self.0.swap(0, Ordering::SeqCst))
    }

    /// Clears the bits of `reason` without servicing them.
    pub fn clear(&self, reason: WakeReason) {
        self.0.fetch_and(!reason.into_bits(), Ordering::SeqCst);
    }

    /// Returns the currently pending set without consuming it.
    pub fn peek(&self) -> WakeReason {
        WakeReason::from_bits(self.0.load(Ordering::SeqCst))
    }
}
