// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The seam to the interpretive-execution hardware.

use crate::VpIndex;
use siedef::ExecutionControlBlock;
use siedef::FacilitySet;
use siedef::FaultClass;
use siedef::FeatureSet;
use siedef::GuestRegisters;
use siedef::InterceptCode;
use siedef::SubfunctionSet;
use thiserror::Error;

/// The host processor identification reported by the capability probe.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CpuIdentity {
    /// The processor identification value.
    pub cpu_id: u64,
    /// The processor version code.
    pub version: u16,
}

/// Why a hardware guest entry returned to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCause {
    /// A host signal or kick interrupted guest execution before or during
    /// interpretation. Nothing guest-visible happened.
    Interrupted,
    /// The hardware classified the exit with an intercept code.
    Intercept(InterceptCode),
    /// The exit was caused by a host-side fault on a guest access
    /// (intercept code zero).
    Fault(GuestFault),
    /// A recoverable machine check was taken while the guest was running.
    MachineCheck {
        /// The machine-check interruption code.
        code: u64,
    },
}

/// A host-side fault on a guest access.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GuestFault {
    /// The faulting guest absolute address.
    pub gpa: u64,
    /// Whether the access was a write.
    pub write: bool,
    /// The hardware classification of the fault.
    pub class: FaultClass,
}

/// The hardware faulted entering guest mode, e.g. an addressing exception
/// on the control block itself.
#[derive(Debug, Error)]
#[error("hardware guest entry fault (code {code:#x})")]
pub struct EntryError {
    /// The hardware-reported fault code.
    pub code: u16,
}

/// Driver for the interpretive-execution facility.
///
/// Everything the engine needs from the hardware passes through this trait:
/// the one-time capability probe, the wall clock, the guest-entry
/// instruction, and the kick that forces a vCPU out of guest mode.
pub trait SieHardware: Send + Sync {
    /// Returns the facility bits installed on the host.
    fn host_facilities(&self) -> FacilitySet;

    /// Returns the optional-feature bits the host can virtualize.
    fn host_features(&self) -> FeatureSet;

    /// Returns the subfunction query blocks sampled from the host.
    fn host_subfunctions(&self) -> SubfunctionSet;

    /// Returns the host processor identification.
    fn host_identity(&self) -> CpuIdentity;

    /// Reads the hardware wall clock.
    fn wall_clock(&self) -> u64;

    /// Enters guest mode for `vp` and runs until an intercept, fault, or
    /// interruption.
    ///
    /// Fields of `scb` and `regs` not written by the engine must be
    /// round-tripped unchanged, except that one-shot controls (the TLB
    /// flush bit) are cleared once applied.
    fn run_guest(
        &self,
        vp: VpIndex,
        scb: &mut ExecutionControlBlock,
        regs: &mut GuestRegisters,
    ) -> Result<ExitCause, EntryError>;

    /// Forces `vp` out of guest mode promptly.
    ///
    /// Kicks are sticky: a kick delivered while the vCPU is outside guest
    /// mode causes its next [`Self::run_guest`] to return
    /// [`ExitCause::Interrupted`] immediately.
    fn kick(&self, vp: VpIndex);
}
