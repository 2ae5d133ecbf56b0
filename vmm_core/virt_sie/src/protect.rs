// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Protected (confidential) execution control.
//!
//! Once a VM is protected, a trusted firmware layer owns guest register
//! and memory confidentiality; this module orchestrates the transitions
//! into and out of that mode. Enabling is all-or-nothing. Disabling is
//! best-effort and never blocks progress, since a VM must always be
//! destroyable: teardown continues past individual failures and reports
//! the first one. The asynchronous teardown path detaches the firmware
//! handles from the live VM so the expensive firmware work can run off the
//! critical path.

use crate::SiePartition;
use crate::SiePartitionInner;
use crate::VpIndex;
use crate::VpRunState;
use crate::memory::PagerError;
use siedef::ProtectedCpuState;
use siedef::facility;
use std::sync::atomic::Ordering;
use thiserror::Error;

/// The firmware's identifier for a protected VM.
///
/// There is no way to destroy a handle directly; teardown goes through
/// [`SiePartition::disable_protected`] or the asynchronous path so that
/// per-CPU contexts are always destroyed before the VM context.
#[derive(Debug, PartialEq, Eq)]
pub struct VmProtectionHandle(u64);

impl VmProtectionHandle {
    /// Wraps a firmware-assigned identifier.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the firmware identifier.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The firmware's identifier for one protected vCPU.
///
/// Like [`VmProtectionHandle`], destruction is only reachable through the
/// controller.
#[derive(Debug, PartialEq, Eq)]
pub struct CpuProtectionHandle(u64);

impl CpuProtectionHandle {
    /// Wraps a firmware-assigned identifier.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the firmware identifier.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A firmware diagnostic: return and reason code.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
#[error("firmware call failed (rc {rc:#x}, rrc {rrc:#x})")]
pub struct FirmwareError {
    /// The firmware return code.
    pub rc: u16,
    /// The firmware reason code.
    pub rrc: u16,
}

/// The protected-execution firmware collaborator.
pub trait ProtectionFirmware: Send + Sync {
    /// Allocates the VM-level protected context.
    fn create_vm(&self) -> Result<VmProtectionHandle, FirmwareError>;

    /// Destroys a VM-level context. All of its CPU contexts must already
    /// be destroyed.
    fn destroy_vm(&self, handle: VmProtectionHandle) -> Result<(), FirmwareError>;

    /// Allocates the per-CPU context for `vp` within `vm`.
    fn create_cpu(
        &self,
        vm: &VmProtectionHandle,
        vp: VpIndex,
    ) -> Result<CpuProtectionHandle, FirmwareError>;

    /// Destroys a per-CPU context.
    fn destroy_cpu(&self, handle: CpuProtectionHandle) -> Result<(), FirmwareError>;

    /// Mirrors a run-state change of a protected vCPU to the firmware,
    /// which is the authority on its architectural state.
    fn set_cpu_state(
        &self,
        handle: &CpuProtectionHandle,
        state: ProtectedCpuState,
    ) -> Result<(), FirmwareError>;

    /// Imports the page at `gpa` into protected storage.
    fn import_page(&self, vm: &VmProtectionHandle, gpa: u64) -> Result<(), FirmwareError>;
}

/// An error changing protected-execution state.
#[derive(Debug, Error)]
pub enum ProtectError {
    /// The host lacks the protected-execution facility, or asynchronous
    /// teardown is not enabled for this deployment.
    #[error("protected execution is not available")]
    Unsupported,
    /// The VM is already protected.
    #[error("the vm is already protected")]
    AlreadyProtected,
    /// The VM is not protected.
    #[error("the vm is not protected")]
    NotProtected,
    /// No prepared teardown is parked.
    #[error("no parked teardown to perform")]
    NotPrepared,
    /// A teardown is already in progress.
    #[error("a protected teardown is already in progress")]
    Busy,
    /// Breaking copy-on-write sharing failed.
    #[error("breaking page sharing failed")]
    Unshare(#[source] PagerError),
    /// The firmware rejected the transition.
    #[error("firmware rejected the transition")]
    Firmware(#[source] FirmwareError),
}

/// The observable protection mode of a VM.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProtectionMode {
    /// Normal execution.
    Unprotected,
    /// Firmware owns guest confidentiality.
    Protected,
    /// Firmware handles are parked awaiting asynchronous teardown.
    AsyncPrepared,
    /// An asynchronous teardown is running.
    AsyncPerforming,
}

/// Protection state reported to the caller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProtectionStatus {
    /// The current protection mode.
    pub mode: ProtectionMode,
    /// Whether interrupt sources that cannot target a protected guest are
    /// masked.
    pub service_signals_masked: bool,
}

/// A detached set of firmware handles awaiting teardown.
#[derive(Debug)]
pub(crate) struct ParkedTeardown {
    pub vm: VmProtectionHandle,
    pub cpus: Vec<CpuProtectionHandle>,
}

/// Protection lifecycle state stored in the VM.
#[derive(Debug)]
pub(crate) enum ProtectionState {
    Unprotected,
    Protected { vm: VmProtectionHandle },
    AsyncPrepared { parked: ParkedTeardown },
    AsyncPerforming,
}

/// Destroys every parked CPU context, then the VM context, continuing past
/// failures. The first failure's diagnostic is the one returned.
pub(crate) fn run_teardown(
    firmware: &dyn ProtectionFirmware,
    parked: ParkedTeardown,
) -> Result<(), FirmwareError> {
    let ParkedTeardown { vm, cpus } = parked;
    let mut first = None;
    for cpu in cpus {
        if let Err(err) = firmware.destroy_cpu(cpu) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "protected cpu teardown failed"
            );
            first.get_or_insert(err);
        }
    }
    if let Err(err) = firmware.destroy_vm(vm) {
        tracing::warn!(
            error = &err as &dyn std::error::Error,
            "protected vm teardown failed"
        );
        first.get_or_insert(err);
    }
    match first {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

impl SiePartition {
    /// Transitions the VM into protected execution.
    ///
    /// All-or-nothing: on any failure the firmware resources already
    /// allocated are released and the VM remains unprotected. The CPU
    /// table is converted to its extended format first (the conversion is
    /// one way and survives a failed enable).
    pub fn enable_protected(&self) -> Result<(), ProtectError> {
        self.inner.enable_protected()
    }

    /// Synchronously tears the VM out of protected execution.
    ///
    /// vCPUs stay blocked for the duration. Teardown continues past
    /// individual firmware failures; the first failure is returned after
    /// the VM has still been returned to the unprotected state.
    pub fn disable_protected(&self) -> Result<(), ProtectError> {
        self.inner.disable_protected()
    }

    /// Detaches the VM's firmware handles and parks them for a later
    /// [`Self::perform_async_teardown`], returning the VM to unprotected
    /// execution immediately.
    pub fn prepare_async_teardown(&self) -> Result<(), ProtectError> {
        self.inner.prepare_async_teardown()
    }

    /// Runs the parked teardown without holding the VM lock.
    ///
    /// Single-flight: a second call while one is outstanding fails with
    /// [`ProtectError::Busy`].
    pub fn perform_async_teardown(&self) -> Result<(), ProtectError> {
        self.inner.perform_async_teardown()
    }

    /// Returns the VM's protection state.
    pub fn protection_status(&self) -> ProtectionStatus {
        self.inner.protection_status()
    }
}

impl SiePartitionInner {
    pub(crate) fn enable_protected(&self) -> Result<(), ProtectError> {
        let mut vm = self.vm.lock();
        match vm.protection {
            ProtectionState::Unprotected => {}
            ProtectionState::Protected { .. } => return Err(ProtectError::AlreadyProtected),
            _ => return Err(ProtectError::Busy),
        }
        if !self
            .model
            .read()
            .facilities
            .is_set(facility::PROTECTED_EXECUTION)
        {
            return Err(ProtectError::Unsupported);
        }
        let _blocked = self.block_all_vps();
        // Firmware tracks CPUs through the extended table only.
        self.convert_cpu_table(&mut vm);
        self.pager.unshare_all().map_err(ProtectError::Unshare)?;
        let vm_handle = self.firmware.create_vm().map_err(ProtectError::Firmware)?;
        let vps = self.vps.read();
        let mut staged = Vec::with_capacity(vps.len());
        for vp in vps.iter() {
            match self.firmware.create_cpu(&vm_handle, vp.index) {
                Ok(cpu) => {
                    // Firmware starts a CPU context stopped; a vCPU that
                    // is already operating must be mirrored immediately.
                    if vp.run_state() == VpRunState::Operating {
                        if let Err(err) = self
                            .firmware
                            .set_cpu_state(&cpu, ProtectedCpuState::Operating)
                        {
                            staged.push(cpu);
                            let _ = run_teardown(
                                self.firmware.as_ref(),
                                ParkedTeardown {
                                    vm: vm_handle,
                                    cpus: staged,
                                },
                            );
                            return Err(ProtectError::Firmware(err));
                        }
                    }
                    staged.push(cpu);
                }
                Err(err) => {
                    let _ = run_teardown(
                        self.firmware.as_ref(),
                        ParkedTeardown {
                            vm: vm_handle,
                            cpus: staged,
                        },
                    );
                    return Err(ProtectError::Firmware(err));
                }
            }
        }
        for (vp, cpu) in vps.iter().zip(staged) {
            *vp.protection.lock() = Some(cpu);
        }
        vm.protection = ProtectionState::Protected { vm: vm_handle };
        vm.service_signals_masked = true;
        self.protected.store(true, Ordering::SeqCst);
        tracing::info!("protected execution enabled");
        Ok(())
    }

    pub(crate) fn disable_protected(&self) -> Result<(), ProtectError> {
        let mut vm = self.vm.lock();
        let _blocked = self.block_all_vps();
        let parked = match std::mem::replace(&mut vm.protection, ProtectionState::Unprotected) {
            ProtectionState::Protected { vm: handle } => ParkedTeardown {
                vm: handle,
                cpus: self.take_cpu_handles(),
            },
            ProtectionState::Unprotected => return Err(ProtectError::NotProtected),
            other => {
                vm.protection = other;
                return Err(ProtectError::Busy);
            }
        };
        vm.service_signals_masked = false;
        self.protected.store(false, Ordering::SeqCst);
        let result = run_teardown(self.firmware.as_ref(), parked);
        tracing::info!("protected execution disabled");
        result.map_err(ProtectError::Firmware)
    }

    pub(crate) fn prepare_async_teardown(&self) -> Result<(), ProtectError> {
        if !self.config.async_teardown {
            return Err(ProtectError::Unsupported);
        }
        let mut vm = self.vm.lock();
        let _blocked = self.block_all_vps();
        match std::mem::replace(&mut vm.protection, ProtectionState::Unprotected) {
            ProtectionState::Protected { vm: handle } => {
                vm.protection = ProtectionState::AsyncPrepared {
                    parked: ParkedTeardown {
                        vm: handle,
                        cpus: self.take_cpu_handles(),
                    },
                };
            }
            ProtectionState::Unprotected => return Err(ProtectError::NotProtected),
            other => {
                vm.protection = other;
                return Err(ProtectError::Busy);
            }
        }
        vm.service_signals_masked = false;
        self.protected.store(false, Ordering::SeqCst);
        tracing::info!("protected teardown prepared");
        Ok(())
    }

    pub(crate) fn perform_async_teardown(&self) -> Result<(), ProtectError> {
        let parked = {
            let mut vm = self.vm.lock();
            match std::mem::replace(&mut vm.protection, ProtectionState::AsyncPerforming) {
                ProtectionState::AsyncPrepared { parked } => parked,
                other => {
                    let err = match &other {
                        ProtectionState::AsyncPerforming => ProtectError::Busy,
                        _ => ProtectError::NotPrepared,
                    };
                    vm.protection = other;
                    return Err(err);
                }
            }
        };
        let result = run_teardown(self.firmware.as_ref(), parked);
        self.vm.lock().protection = ProtectionState::Unprotected;
        tracing::info!("protected teardown performed");
        result.map_err(ProtectError::Firmware)
    }

    pub(crate) fn protection_status(&self) -> ProtectionStatus {
        let vm = self.vm.lock();
        ProtectionStatus {
            mode: match vm.protection {
                ProtectionState::Unprotected => ProtectionMode::Unprotected,
                ProtectionState::Protected { .. } => ProtectionMode::Protected,
                ProtectionState::AsyncPrepared { .. } => ProtectionMode::AsyncPrepared,
                ProtectionState::AsyncPerforming => ProtectionMode::AsyncPerforming,
            },
            service_signals_masked: vm.service_signals_masked,
        }
    }

    /// Imports a page the guest faulted on into protected storage.
    pub(crate) fn import_protected_page(&self, gpa: u64) -> Result<(), ProtectError> {
        let vm = self.vm.lock();
        match &vm.protection {
            ProtectionState::Protected { vm: handle } => self
                .firmware
                .import_page(handle, gpa)
                .map_err(ProtectError::Firmware),
            _ => Err(ProtectError::NotProtected),
        }
    }

    pub(crate) fn take_cpu_handles(&self) -> Vec<CpuProtectionHandle> {
        self.vps
            .read()
            .iter()
            .filter_map(|vp| vp.protection.lock().take())
            .collect()
    }
}
