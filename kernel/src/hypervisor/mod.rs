//! Intel VT-x hypervisor
//!
//! VMXON/VMCS plumbing, EPT construction, the per-guest VM object with its
//! software LAPIC, guest-exit IPC, and VT-d context table setup for
//! passthrough devices.

pub mod ept;
pub mod iommu;
pub mod ipc;
pub mod vm;
pub mod vmx;

use crate::error::KernelError;

/// Hypervisor error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    VmxNotSupported,
    VmxAlreadyEnabled,
    VmxOperationFailed,
    VmcsAllocationFailed,
    VmcsFieldError,
    VmEntryFailed,
    EptMappingFailed,
    EptFault,
    GuestMemoryError,
    InvalidVmState,
    UnknownVm,
    MsrDenied,
    VmExitHandlerError,
    InvalidGuestState,
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::VmxNotSupported => write!(f, "VMX not supported"),
            Self::VmxAlreadyEnabled => write!(f, "VMX already enabled"),
            Self::VmxOperationFailed => write!(f, "VMX operation failed"),
            Self::VmcsAllocationFailed => write!(f, "VMCS allocation failed"),
            Self::VmcsFieldError => write!(f, "VMCS field error"),
            Self::VmEntryFailed => write!(f, "VM entry failed"),
            Self::EptMappingFailed => write!(f, "EPT mapping failed"),
            Self::EptFault => write!(f, "EPT translation fault"),
            Self::GuestMemoryError => write!(f, "guest memory error"),
            Self::InvalidVmState => write!(f, "invalid VM state"),
            Self::UnknownVm => write!(f, "unknown VM id"),
            Self::MsrDenied => write!(f, "MSR access denied"),
            Self::VmExitHandlerError => write!(f, "VM exit handler error"),
            Self::InvalidGuestState => write!(f, "invalid guest state"),
        }
    }
}

impl From<VmError> for KernelError {
    fn from(e: VmError) -> Self {
        match e {
            VmError::EptFault => KernelError::EptFault,
            VmError::UnknownVm => KernelError::NotFound,
            VmError::MsrDenied => KernelError::NotOwned,
            _ => KernelError::VmxFailure,
        }
    }
}

/// VM exit basic reasons (Intel SDM Vol. 3C, Appendix C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VmExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InterruptWindow = 7,
    TaskSwitch = 9,
    Cpuid = 10,
    Hlt = 12,
    Invlpg = 14,
    Rdtsc = 16,
    Vmcall = 18,
    CrAccess = 28,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    EntryFailInvalidGuestState = 33,
    EptViolation = 48,
    EptMisconfiguration = 49,
    PreemptionTimer = 52,
    Unknown = 0xFFFF,
}

impl VmExitReason {
    pub fn from_raw(raw: u32) -> Self {
        match raw & 0xFFFF {
            0 => Self::ExceptionOrNmi,
            1 => Self::ExternalInterrupt,
            2 => Self::TripleFault,
            7 => Self::InterruptWindow,
            9 => Self::TaskSwitch,
            10 => Self::Cpuid,
            12 => Self::Hlt,
            14 => Self::Invlpg,
            16 => Self::Rdtsc,
            18 => Self::Vmcall,
            28 => Self::CrAccess,
            30 => Self::IoInstruction,
            31 => Self::Rdmsr,
            32 => Self::Wrmsr,
            33 => Self::EntryFailInvalidGuestState,
            48 => Self::EptViolation,
            49 => Self::EptMisconfiguration,
            52 => Self::PreemptionTimer,
            _ => Self::Unknown,
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_exit_reason_decode() {
        assert_eq!(VmExitReason::from_raw(18), VmExitReason::Vmcall);
        assert_eq!(VmExitReason::from_raw(48), VmExitReason::EptViolation);
        // Entry-failure bit 31 set does not change the basic reason.
        assert_eq!(
            VmExitReason::from_raw(0x8000_0021),
            VmExitReason::EntryFailInvalidGuestState
        );
        assert_eq!(VmExitReason::from_raw(1234), VmExitReason::Unknown);
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(KernelError::from(VmError::EptFault), KernelError::EptFault);
        assert_eq!(KernelError::from(VmError::UnknownVm), KernelError::NotFound);
        assert_eq!(
            KernelError::from(VmError::VmEntryFailed),
            KernelError::VmxFailure
        );
    }
}
