//! Error handling for the synchronization primitives.
//!
//! Every operation returns a classified [`SyncError`] instead of setting a
//! global error variable. Compatibility layers (POSIX or C11 style thread
//! APIs) translate the kind into their own convention, usually through
//! [`SyncError::errno`].

use thiserror::Error;

/// Result type for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Error kinds reported by the synchronization primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum SyncError {
    /// Bad init parameter, destroyed or uninitialized handle, out-of-range key
    #[error("invalid argument")]
    InvalidArgument,
    /// Destroy attempted while the primitive is in use
    #[error("resource busy")]
    Busy,
    /// Non-blocking variant hit contention
    #[error("operation would block")]
    WouldBlock,
    /// Timed variant exceeded its deadline
    #[error("operation timed out")]
    TimedOut,
    /// Operation illegal in the current context (e.g. blocking inside an IRQ)
    #[error("operation not permitted in the current context")]
    PermissionDenied,
    /// Recursive lock counter would overflow
    #[error("recursion limit reached")]
    ResourceExhausted,
    /// Allocation of a TLS entry or destructor node failed
    #[error("out of memory")]
    OutOfMemory,
    /// The primitive was destroyed while the caller was blocked on it
    #[error("state not recoverable: primitive destroyed")]
    Unrecoverable,
    /// An error-checking mutex was relocked by its holder
    #[error("deadlock detected")]
    WouldDeadlock,
    /// An error-checking mutex was unlocked by a thread that does not hold it
    #[error("lock not held by caller")]
    NotOwner,
}

/// errno values used by the newlib-based C runtime of the target.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const EAGAIN: i32 = 11;
    pub const EWOULDBLOCK: i32 = EAGAIN;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const EDEADLK: i32 = 45;
    pub const ETIMEDOUT: i32 = 116;
    pub const ENOTRECOVERABLE: i32 = 141;
}

impl SyncError {
    /// The errno value a C wrapper should report for this error.
    pub const fn errno(self) -> i32 {
        match self {
            SyncError::InvalidArgument => errno::EINVAL,
            SyncError::Busy => errno::EBUSY,
            SyncError::WouldBlock => errno::EWOULDBLOCK,
            SyncError::TimedOut => errno::ETIMEDOUT,
            SyncError::PermissionDenied => errno::EPERM,
            SyncError::ResourceExhausted => errno::EAGAIN,
            SyncError::OutOfMemory => errno::ENOMEM,
            SyncError::Unrecoverable => errno::ENOTRECOVERABLE,
            SyncError::WouldDeadlock => errno::EDEADLK,
            SyncError::NotOwner => errno::EPERM,
        }
    }

    /// Whether retrying the same call later may succeed.
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            SyncError::Busy | SyncError::WouldBlock | SyncError::TimedOut
        )
    }
}
