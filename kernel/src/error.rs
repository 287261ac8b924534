//! Kernel error types.
//!
//! Two layers: [`KernelError`] for failures inside kernel subsystems, and
//! [`Errno`] for the syscall boundary, where errors travel as negated
//! POSIX-style integers in the return register.

use core::fmt;

/// Kernel-internal error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical or heap memory exhausted.
    OutOfMemory,
    /// A caller-supplied value was malformed.
    InvalidArgument,
    /// Address is not page-aligned.
    Misaligned { addr: u64 },
    /// Virtual address has no mapping.
    Unmapped { addr: u64 },
    /// Mapping would land in a range the caller may not touch.
    ForbiddenRange { addr: u64 },
    /// A fixed-capacity kernel table is full.
    TableFull { table: &'static str },
    /// Object not found in a registry.
    NotFound { what: &'static str, id: u64 },
    /// Object already present in a registry.
    AlreadyExists { what: &'static str, id: u64 },
    /// Subsystem used before its init() ran.
    NotInitialized { subsystem: &'static str },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "out of memory"),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::Misaligned { addr } => write!(f, "misaligned address {addr:#x}"),
            KernelError::Unmapped { addr } => write!(f, "unmapped address {addr:#x}"),
            KernelError::ForbiddenRange { addr } => write!(f, "forbidden range {addr:#x}"),
            KernelError::TableFull { table } => write!(f, "{table} table full"),
            KernelError::NotFound { what, id } => write!(f, "{what} {id} not found"),
            KernelError::AlreadyExists { what, id } => write!(f, "{what} {id} already exists"),
            KernelError::NotInitialized { subsystem } => {
                write!(f, "{subsystem} not initialized")
            }
        }
    }
}

/// POSIX-style error numbers used at the syscall boundary.
///
/// Values match the conventional Linux numbering so user-space libc wrappers
/// can decode them without translation.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "errno values must reach the syscall boundary"]
pub enum Errno {
    Eperm = 1,
    Enoent = 2,
    Esrch = 3,
    Eio = 5,
    Ebadf = 9,
    Eagain = 11,
    Enomem = 12,
    Eacces = 13,
    Efault = 14,
    Eexist = 17,
    Einval = 22,
    Emfile = 24,
    Espipe = 29,
    Epipe = 32,
    Enosys = 38,
    Enobufs = 105,
    Etimedout = 110,
}

impl Errno {
    /// Encode as the negated integer a syscall returns in the result register.
    pub const fn as_ret(self) -> u64 {
        (-(self as i64)) as u64
    }
}

impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::OutOfMemory => Errno::Enomem,
            KernelError::InvalidArgument | KernelError::Misaligned { .. } => Errno::Einval,
            KernelError::Unmapped { .. } => Errno::Efault,
            KernelError::ForbiddenRange { .. } => Errno::Eacces,
            KernelError::TableFull { .. } => Errno::Enobufs,
            KernelError::NotFound { .. } => Errno::Enoent,
            KernelError::AlreadyExists { .. } => Errno::Eexist,
            KernelError::NotInitialized { .. } => Errno::Enosys,
        }
    }
}

/// Result type for kernel-internal operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Result type for syscall handlers; encoded by the dispatcher.
pub type SysResult = Result<u64, Errno>;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn errno_encodes_as_negated_value() {
        assert_eq!(Errno::Einval.as_ret() as i64, -22);
        assert_eq!(Errno::Etimedout.as_ret() as i64, -110);
    }

    #[test]
    fn kernel_errors_map_to_sensible_errnos() {
        assert_eq!(Errno::from(KernelError::OutOfMemory), Errno::Enomem);
        assert_eq!(
            Errno::from(KernelError::Unmapped { addr: 0x1000 }),
            Errno::Efault
        );
        assert_eq!(
            Errno::from(KernelError::TableFull { table: "irq" }),
            Errno::Enobufs
        );
    }
}
