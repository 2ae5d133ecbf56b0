// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Architectural definitions for the interpretive-execution virtualization
//! facility: the control block handed to the hardware guest-entry
//! instruction, intercept and fault classification codes, facility and
//! feature bit sets, and the fixed limits of the CPU addressing tables.
//!
//! Everything in this crate is plain data. The execution engine that drives
//! these structures lives in `virt_sie`.

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Guest page size in bytes.
pub const PAGE_SIZE: u64 = 4096;
/// Guest page shift.
pub const PAGE_SHIFT: u32 = 12;
/// Number of pages in a vCPU's prefix region.
pub const PREFIX_PAGES: u64 = 2;
/// Size of the prefix region in bytes.
pub const PREFIX_SIZE: u64 = PREFIX_PAGES * PAGE_SIZE;

/// CPU slots addressable through the basic-format CPU table.
pub const BASIC_CPU_SLOTS: u32 = 64;
/// CPU slots addressable through the extended-format CPU table.
pub const EXTENDED_CPU_SLOTS: u32 = 248;

/// The format of the per-VM CPU addressing table.
///
/// The table starts in basic format and is converted to extended format when
/// a vCPU id beyond the basic limit is created or when protected execution
/// is enabled (firmware requires the extended form to track CPUs). The
/// conversion is one way.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CpuTableFormat {
    /// Basic table, up to [`BASIC_CPU_SLOTS`] CPUs.
    Basic,
    /// Extended table, up to [`EXTENDED_CPU_SLOTS`] CPUs.
    Extended,
}

impl CpuTableFormat {
    /// The number of CPU slots addressable in this format.
    pub fn cpu_slots(&self) -> u32 {
        match self {
            CpuTableFormat::Basic => BASIC_CPU_SLOTS,
            CpuTableFormat::Extended => EXTENDED_CPU_SLOTS,
        }
    }
}

/// Intercept codes reported by the hardware when guest execution returns to
/// the host. A code of zero means the exit was caused by a host-side fault
/// on a guest access rather than an architectural intercept.
#[derive(Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
#[repr(transparent)]
pub struct InterceptCode(pub u8);

impl InterceptCode {
    /// No intercept; the exit was caused by a host fault.
    pub const NONE: Self = Self(0x00);
    /// An instruction requires host completion.
    pub const INSTRUCTION: Self = Self(0x04);
    /// A program interruption occurred in the guest.
    pub const PROGRAM: Self = Self(0x08);
    /// Instruction and program interruption combined.
    pub const INSTRUCTION_AND_PROGRAM: Self = Self(0x0c);
    /// An external interruption is pending for the guest.
    pub const EXTERNAL_REQUEST: Self = Self(0x10);
    /// An external interruption must be injected by the host.
    pub const EXTERNAL_INTERRUPT: Self = Self(0x14);
    /// An I/O interruption is pending for the guest.
    pub const IO_REQUEST: Self = Self(0x18);
    /// The guest entered the wait state.
    pub const WAIT: Self = Self(0x1c);
    /// The control block failed hardware validity checks.
    pub const VALIDITY: Self = Self(0x20);
    /// A stop request for the vCPU is pending.
    pub const STOP_REQUEST: Self = Self(0x28);
    /// The guest executed an operation exception the host may emulate.
    pub const OPERATION_EXCEPTION: Self = Self(0x2c);
    /// An interpreted instruction needs host assistance to complete.
    pub const PARTIAL_EXECUTION: Self = Self(0x38);
    /// Protected-execution firmware raised a notification.
    pub const SECURE_NOTIFICATION: Self = Self(0x3c);

    const NAMES: &'static [(InterceptCode, &'static str)] = &[
        (Self::NONE, "NONE"),
        (Self::INSTRUCTION, "INSTRUCTION"),
        (Self::PROGRAM, "PROGRAM"),
        (Self::INSTRUCTION_AND_PROGRAM, "INSTRUCTION_AND_PROGRAM"),
        (Self::EXTERNAL_REQUEST, "EXTERNAL_REQUEST"),
        (Self::EXTERNAL_INTERRUPT, "EXTERNAL_INTERRUPT"),
        (Self::IO_REQUEST, "IO_REQUEST"),
        (Self::WAIT, "WAIT"),
        (Self::VALIDITY, "VALIDITY"),
        (Self::STOP_REQUEST, "STOP_REQUEST"),
        (Self::OPERATION_EXCEPTION, "OPERATION_EXCEPTION"),
        (Self::PARTIAL_EXECUTION, "PARTIAL_EXECUTION"),
        (Self::SECURE_NOTIFICATION, "SECURE_NOTIFICATION"),
    ];
}

impl core::fmt::Debug for InterceptCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match Self::NAMES.iter().find(|(code, _)| code == self) {
            Some((_, name)) => f.pad(name),
            None => write!(f, "InterceptCode({:#x})", self.0),
        }
    }
}

/// Program-interruption codes the engine injects into the guest.
#[derive(Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
#[repr(transparent)]
pub struct ProgramCode(pub u16);

impl ProgramCode {
    /// Operation exception.
    pub const OPERATION: Self = Self(0x0001);
    /// Addressing exception.
    pub const ADDRESSING: Self = Self(0x0005);
    /// Specification exception.
    pub const SPECIFICATION: Self = Self(0x0006);
    /// Page-translation exception.
    pub const PAGE_TRANSLATION: Self = Self(0x0011);
}

impl core::fmt::Debug for ProgramCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ProgramCode({:#x})", self.0)
    }
}

/// Classification of a guest-access fault that caused a zero-intercept exit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultClass {
    /// An ordinary host translation fault on a guest page.
    Translation,
    /// A protected guest touched a page not yet imported into protected
    /// storage.
    NonSecureStorage,
    /// The host holds a stale mapping of a page that is now in protected
    /// storage.
    SecureStorageAccess,
    /// An unrecoverable protected-storage integrity violation.
    SecureStorageViolation,
}

/// Runtime state of a protected vCPU, as reported to the firmware.
///
/// Once protected execution is active the firmware is the authority on a
/// vCPU's architectural state, so every run-state change is mirrored to it
/// with one of these codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtectedCpuState {
    /// The vCPU is stopped.
    Stopped = 0x01,
    /// The vCPU is operating.
    Operating = 0x02,
    /// The vCPU is stopped mid-load; only reachable under protected
    /// execution.
    Load = 0x05,
}

impl From<ProtectedCpuState> for u8 {
    fn from(value: ProtectedCpuState) -> Self {
        value as _
    }
}

/// Execution-control bits consumed by the hardware on guest entry.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct ExecutionControls {
    /// Flush the guest TLB on the next entry. Cleared by hardware.
    pub flush_tlb: bool,
    /// Interpretation buffering is enabled for this vCPU. Valid only while
    /// it is the sole operating vCPU of its VM.
    pub interpretation_buffering: bool,
    /// Hardware interprets page-usage classification updates directly
    /// (live-migration assist).
    pub classification_assist: bool,
    /// The vCPU runs under protected-execution firmware.
    pub protected: bool,
    /// Guest-initiated asynchronous fault notifications are armed.
    pub async_fault: bool,
    #[bits(27)]
    _reserved: u32,
}

/// The hardware control block for one vCPU.
///
/// This structure is passed by exclusive reference into the guest-entry
/// instruction. Fields not interpreted by the execution engine are opaque
/// bytes and must be round-tripped unchanged.
#[repr(C)]
#[derive(Debug, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ExecutionControlBlock {
    /// Intercept code written by hardware on exit.
    pub intercept_code: InterceptCode,
    /// Additional intercept qualification written by hardware.
    pub intercept_status: u8,
    _reserved0: [u8; 2],
    /// Execution controls consumed on entry.
    pub controls: ExecutionControls,
    /// Guest absolute address of the prefix region.
    pub prefix: u64,
    /// Program-status word mask.
    pub psw_mask: u64,
    /// Program-status word instruction address.
    pub psw_addr: u64,
    /// Wall-clock epoch offset applied to the guest clock, two's complement.
    pub epoch: u64,
    /// Extension index of the epoch offset.
    pub epoch_index: u8,
    _reserved1: [u8; 7],
    /// Guest CPU timer.
    pub cpu_timer: u64,
    /// Guest clock comparator.
    pub clock_comparator: u64,
    /// Facility doublewords consulted by hardware during interpretation.
    pub facilities: [u64; 4],
    /// Guest control registers.
    pub control_registers: [u64; 16],
    _reserved2: [u8; 288],
}

const_assert_eq!(size_of::<ExecutionControlBlock>(), 512);

impl ExecutionControlBlock {
    /// Returns a zeroed control block.
    pub fn new() -> Self {
        FromZeros::new_zeroed()
    }
}

/// The general-register mirror passed to the guest-entry instruction
/// alongside the control block.
#[repr(C)]
#[derive(Debug, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GuestRegisters {
    /// General registers.
    pub gprs: [u64; 16],
}

const_assert_eq!(size_of::<GuestRegisters>(), 128);

impl GuestRegisters {
    /// Returns a zeroed register mirror.
    pub fn new() -> Self {
        FromZeros::new_zeroed()
    }
}

macro_rules! bit_set {
    ($(#[$meta:meta])* $name:ident, $words:expr) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
        pub struct $name(pub [u64; $words]);

        impl $name {
            /// The number of bits in the set.
            pub const BITS: u32 = $words as u32 * 64;

            /// Returns the empty set.
            pub const fn empty() -> Self {
                Self([0; $words])
            }

            /// Returns whether bit `n` is set.
            ///
            /// Bit `n` corresponds to architecturally-defined capability `n`.
            pub fn is_set(&self, n: u32) -> bool {
                n < Self::BITS && self.0[n as usize / 64] & (1 << (n % 64)) != 0
            }

            /// Sets or clears bit `n`.
            pub fn set(&mut self, n: u32, value: bool) -> &mut Self {
                assert!(n < Self::BITS);
                let word = &mut self.0[n as usize / 64];
                if value {
                    *word |= 1 << (n % 64);
                } else {
                    *word &= !(1 << (n % 64));
                }
                self
            }

            /// Returns the bitwise intersection of `self` and `other`.
            pub fn intersect(&self, other: &Self) -> Self {
                let mut words = [0; $words];
                for (out, (a, b)) in words
                    .iter_mut()
                    .zip(self.0.iter().zip(other.0.iter()))
                {
                    *out = a & b;
                }
                Self(words)
            }

            /// Returns whether every bit of `self` is also set in `other`.
            pub fn is_subset_of(&self, other: &Self) -> bool {
                self.0.iter().zip(other.0.iter()).all(|(a, b)| a & !b == 0)
            }

            /// Returns the number of set bits.
            pub fn count_ones(&self) -> u32 {
                self.0.iter().map(|w| w.count_ones()).sum()
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!(stringify!($name), "("))?;
                for (i, word) in self.0.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{:016x}", word)?;
                }
                write!(f, ")")
            }
        }
    };
}

bit_set! {
    /// The architectural facility bit vector. Bit `n` corresponds to
    /// facility `n`; combining a host and a guest set is always a bitwise
    /// AND, so a guest can never claim a facility the host lacks.
    FacilitySet, 16
}

bit_set! {
    /// The negotiated optional-feature bit vector.
    FeatureSet, 4
}

/// Well-known facility numbers consulted by the execution engine.
pub mod facility {
    /// Interpretation buffering is implemented.
    pub const INTERPRETATION_BUFFERING: u32 = 9;
    /// Hardware page-usage classification assist is implemented.
    pub const CLASSIFICATION_ASSIST: u32 = 14;
    /// The extended-format CPU addressing table is implemented.
    pub const EXTENDED_CPU_TABLE: u32 = 21;
    /// Protected-execution firmware is installed.
    pub const PROTECTED_EXECUTION: u32 = 27;
    /// The wall-clock epoch extension index is implemented.
    pub const EPOCH_EXTENSION: u32 = 42;
    /// Nested interpretive execution is implemented.
    pub const NESTED_INTERPRETATION: u32 = 57;
}

/// Well-known feature numbers consulted by the execution engine.
pub mod feature {
    /// Guest may arm asynchronous fault notifications.
    pub const ASYNC_FAULT: u32 = 3;
    /// Guest page-usage classification is virtualized for migration.
    pub const CLASSIFICATION: u32 = 6;
    /// Guest may run nested interpretive-execution contexts.
    pub const NESTED_INTERPRETATION: u32 = 11;
}

/// Per-subfunction query-result blocks, as returned by the corresponding
/// query instructions. Each block is an opaque bit vector describing which
/// subfunctions of one facility are installed.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SubfunctionSet {
    /// Perform-locked-operation subfunctions.
    pub locked_operation: [u8; 32],
    /// Timing-facility subfunctions.
    pub timing: [u8; 16],
    /// Cipher-message subfunctions.
    pub cipher_message: [u8; 16],
    /// Message-authentication subfunctions.
    pub message_auth: [u8; 16],
    /// Compute-digest subfunctions.
    pub compute_digest: [u8; 16],
    /// Random-number subfunctions.
    pub random_number: [u8; 16],
}

const_assert_eq!(size_of::<SubfunctionSet>(), 112);

impl SubfunctionSet {
    /// Returns an all-zero subfunction set.
    pub fn new() -> Self {
        FromZeros::new_zeroed()
    }

    /// Returns the bytewise intersection of `self` and `other`.
    pub fn intersect(&self, other: &Self) -> Self {
        let mut out = *self;
        for (byte, mask) in out.as_mut_bytes().iter_mut().zip(other.as_bytes()) {
            *byte &= mask;
        }
        out
    }
}
