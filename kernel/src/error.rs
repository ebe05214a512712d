//! Kernel-wide error types
//!
//! Every fallible operation in the kernel returns an explicit result built on
//! [`KernelError`]; nothing throws. Panics are reserved for invariant
//! corruption detected at runtime (see the paging and frame allocator
//! internals).

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Out of physical frames or heap bytes
    OutOfMemory,
    /// A caller-supplied argument is malformed
    InvalidArgument,
    /// The named entity does not exist
    NotFound,
    /// The named entity already exists
    AlreadyExists,
    /// A frame or range collides with one already handed out
    Overlap,
    /// Release of a resource the caller does not own
    NotOwned,
    /// A block device or backend read/write failed
    IoFailure,
    /// On-disk checksum mismatch
    Checksum,
    /// On-disk structure carries a version this kernel does not speak
    UnsupportedVersion,
    /// A VMX instruction or VMCS field operation failed
    VmxFailure,
    /// EPT walk hit a non-present entry
    EptFault,
    /// A wait was interrupted
    Interrupted,
    /// The operation would block and the caller asked not to
    WouldBlock,
    /// Internal inconsistency that is recoverable for the caller
    Internal,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::Overlap => write!(f, "range overlap"),
            Self::NotOwned => write!(f, "not owned by caller"),
            Self::IoFailure => write!(f, "i/o failure"),
            Self::Checksum => write!(f, "checksum mismatch"),
            Self::UnsupportedVersion => write!(f, "unsupported version"),
            Self::VmxFailure => write!(f, "vmx operation failed"),
            Self::EptFault => write!(f, "ept translation fault"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::Internal => write!(f, "internal error"),
        }
    }
}

/// Convenient result alias used across the kernel
pub type KernelResult<T> = core::result::Result<T, KernelError>;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_display_covers_taxonomy() {
        let kinds = [
            KernelError::OutOfMemory,
            KernelError::InvalidArgument,
            KernelError::NotFound,
            KernelError::AlreadyExists,
            KernelError::Overlap,
            KernelError::NotOwned,
            KernelError::IoFailure,
            KernelError::Checksum,
            KernelError::UnsupportedVersion,
            KernelError::VmxFailure,
            KernelError::EptFault,
            KernelError::Interrupted,
            KernelError::WouldBlock,
            KernelError::Internal,
        ];
        for k in kinds {
            let mut buf = alloc::string::String::new();
            core::fmt::write(&mut buf, format_args!("{}", k)).unwrap();
            assert!(!buf.is_empty());
        }
    }
}
