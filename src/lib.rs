#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![forbid(unreachable_pub)]

//! Interrupt-aware synchronization primitives for single-core embedded
//! kernels.
//!
//! The crate provides the locking layer that sits between a kernel's
//! scheduler and its thread APIs:
//!
//! - [`Mutex`]: normal, recursive and error-checking mutexes with priority
//!   inheritance, lockable from interrupt handlers with `trylock`
//! - [`RwSemaphore`]: reader/writer semaphore with upgrade
//! - [`Semaphore`]: counting semaphore
//! - [`CondVar`]: condition variable with real-time or monotonic deadlines
//! - [`TlsRegistry`]: thread-local storage keys with exit destructors
//!
//! The scheduler, wait queues, interrupt masking and clocks are supplied by
//! the platform through the [`Kernel`] trait.
//!
//! # Features
//!
//! - `std-shim`: build [`hosted::HostedKernel`], a `Kernel` running on a std
//!   host, for development and testing
//!
//! # Quick Start
//!
//! ```ignore
//! use preemptive_sync::{Kernel, Mutex, Semaphore};
//!
//! fn worker<K: Kernel>(lock: &Mutex<'_, K>, ready: &Semaphore<'_, K>) {
//!     ready.wait().expect("semaphore destroyed");
//!     let _held = lock.lock_scoped().expect("mutex destroyed");
//!     /* critical section */
//! }
//! ```
//!
//! Interrupt handlers use the `*_irqsafe` entry points, which fall back to
//! non-blocking attempts when called from interrupt context.

pub mod errors;
pub mod kernel;
pub mod sync;
pub mod thread;
pub mod time;
pub mod tls;

#[cfg(any(test, feature = "std-shim"))]
pub mod hosted;

#[cfg(test)]
mod tests;

#[cfg(any(test, feature = "std-shim"))]
extern crate std;

extern crate alloc;

// ============================================================================
// Public API
// ============================================================================

// Kernel
pub use kernel::{IrqGuard, IrqState, Kernel, WaitToken};

// Primitives
pub use sync::{CondAttr, CondVar, Mutex, MutexGuard, MutexType, RwSemaphore, Semaphore, MAX_RECURSION};

// Threads
pub use thread::{priority, Owner, ThreadId, ThreadState};

// Thread-local storage
pub use tls::{Destructor, ThreadLocals, TlsKey, TlsRegistry, TLS_DESTRUCTOR_ITERATIONS};

// Time
pub use time::{ClockId, Deadline, Duration, Instant, Timespec};

// Errors
pub use errors::{SyncError, SyncResult};
