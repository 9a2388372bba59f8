//! Blocking synchronization primitives.
//!
//! Every primitive borrows the [`Kernel`](crate::Kernel) it runs on. Short
//! state updates happen under an [`IrqGuard`](crate::kernel::IrqGuard) or a
//! single atomic operation; the only place a caller can be suspended is the
//! kernel's wait queue.

pub mod condvar;
pub mod mutex;
pub mod rwsem;
pub mod semaphore;

pub use condvar::{CondAttr, CondVar};
pub use mutex::{Mutex, MutexGuard, MutexType, MAX_RECURSION};
pub use rwsem::RwSemaphore;
pub use semaphore::Semaphore;
