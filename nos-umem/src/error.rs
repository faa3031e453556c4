//! Error type for pinned user-memory operations

use core::fmt;

/// Errors reported by region acquisition, access and invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UmemError {
    /// Zero length, wrapping range or range beyond the address space
    InvalidRange,
    /// Write access requested on a read-only mapping
    PermissionDenied,
    /// Address range is not mapped
    Fault,
    /// Physical memory pressure
    OutOfMemory,
    /// Pinned-page limit of the address space reached
    ResourceExhausted,
    /// Peer memory is not allowed or lacks a required capability
    UnsupportedPeerMemory,
    /// The page-size bitmap does not include the system page size
    NoCompatiblePageSize,
    /// Copy past the end of the region
    OutOfBounds,
    /// An invalidation notifier is already installed
    AlreadyRegistered,
    /// No invalidation notifier is installed
    NotRegistered,
    /// The region is already being invalidated or released
    TearingDown,
    /// The peer memory backing the region has been revoked
    Invalidated,
    /// Requested mode is not supported (on-demand paging)
    Unsupported,
    /// Configuration value out of range
    InvalidConfig,
}

impl UmemError {
    /// Negative errno a syscall boundary reports for this error.
    pub const fn errno(self) -> i32 {
        match self {
            UmemError::InvalidRange
            | UmemError::NoCompatiblePageSize
            | UmemError::OutOfBounds
            | UmemError::InvalidConfig => -22, // EINVAL
            UmemError::PermissionDenied => -13,  // EACCES
            UmemError::Fault | UmemError::Invalidated => -14, // EFAULT
            UmemError::OutOfMemory | UmemError::ResourceExhausted => -12, // ENOMEM
            UmemError::UnsupportedPeerMemory | UmemError::Unsupported => -95, // EOPNOTSUPP
            UmemError::AlreadyRegistered => -17, // EEXIST
            UmemError::NotRegistered => -2,      // ENOENT
            UmemError::TearingDown => -16,       // EBUSY
        }
    }

    /// Whether retrying after releasing other regions may succeed.
    pub const fn is_recoverable(self) -> bool {
        matches!(self, UmemError::OutOfMemory | UmemError::ResourceExhausted)
    }
}

impl fmt::Display for UmemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UmemError::InvalidRange => write!(f, "Invalid address range"),
            UmemError::PermissionDenied => write!(f, "Permission denied"),
            UmemError::Fault => write!(f, "Address range not mapped"),
            UmemError::OutOfMemory => write!(f, "Out of memory"),
            UmemError::ResourceExhausted => write!(f, "Pinned page limit exceeded"),
            UmemError::UnsupportedPeerMemory => write!(f, "Unsupported peer memory"),
            UmemError::NoCompatiblePageSize => write!(f, "No compatible page size"),
            UmemError::OutOfBounds => write!(f, "Access beyond region end"),
            UmemError::AlreadyRegistered => write!(f, "Invalidation notifier already registered"),
            UmemError::NotRegistered => write!(f, "Invalidation notifier not registered"),
            UmemError::TearingDown => write!(f, "Region is being torn down"),
            UmemError::Invalidated => write!(f, "Region memory has been invalidated"),
            UmemError::Unsupported => write!(f, "Operation not supported"),
            UmemError::InvalidConfig => write!(f, "Invalid configuration"),
        }
    }
}

/// Result type for pinned user-memory operations
pub type Result<T> = core::result::Result<T, UmemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(UmemError::Fault.errno(), -14);
        assert_eq!(UmemError::ResourceExhausted.errno(), -12);
        assert_eq!(UmemError::OutOfBounds.errno(), -22);
    }

    #[test]
    fn test_recoverable() {
        assert!(UmemError::ResourceExhausted.is_recoverable());
        assert!(!UmemError::PermissionDenied.is_recoverable());
    }
}
