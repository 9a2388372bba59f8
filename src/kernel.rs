//! The kernel services the synchronization primitives are built on.
//!
//! The scheduler, the generic wait queues ("genwait"), interrupt masking, the
//! clocks and the allocator are not part of this crate. A platform provides
//! them by implementing [`Kernel`]; every primitive borrows its kernel for
//! its whole lifetime.

use crate::errors::{SyncError, SyncResult};
use crate::thread::{ThreadId, ThreadState};
use crate::time::{ClockId, Instant, Timespec};
use crate::tls::ThreadLocals;

/// Opaque interrupt state returned by [`Kernel::irq_disable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqState(pub usize);

/// Identifies the set of threads waiting for the same event.
///
/// By convention this is the address of the primitive being waited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitToken(usize);

impl WaitToken {
    /// Token derived from the address of `object`.
    pub fn of<T: ?Sized>(object: &T) -> Self {
        Self(object as *const T as *const () as usize)
    }

    /// Token from a raw value.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> usize {
        self.0
    }
}

/// Kernel services consumed by the synchronization primitives.
///
/// Implementations must be usable from any thread and from interrupt
/// handlers. Only [`Kernel::genwait_wait`] may suspend the caller.
pub trait Kernel: Sync {
    /// Identity of the running thread.
    ///
    /// Inside an interrupt handler this is the thread that was preempted.
    fn current_thread(&self) -> ThreadId;

    /// Whether the caller is running inside an interrupt handler.
    fn in_interrupt(&self) -> bool;

    /// Effective (possibly boosted) priority of `thread`.
    fn priority(&self, thread: ThreadId) -> u8;

    /// Change the effective priority of `thread`, leaving its base
    /// priority untouched.
    fn set_priority(&self, thread: ThreadId, priority: u8);

    /// Drop any boost and return `thread` to its base priority.
    fn restore_priority(&self, thread: ThreadId);

    /// Scheduling state of `thread`.
    fn thread_state(&self, thread: ThreadId) -> ThreadState;

    /// Reposition a ready `thread` in the run queue after its priority
    /// changed (remove it, then insert it again).
    fn requeue(&self, thread: ThreadId);

    /// Call `f` with the TLS list of every live thread.
    ///
    /// `f` must not call back into the kernel.
    fn for_each_thread(&self, f: &mut dyn FnMut(ThreadId, &mut ThreadLocals));

    /// Run `f` on the TLS list of the current thread.
    ///
    /// `f` must not call back into the kernel.
    fn with_current_locals<R>(&self, f: impl FnOnce(&mut ThreadLocals) -> R) -> R;

    /// Mask interrupts, returning the previous state. Calls nest.
    fn irq_disable(&self) -> IrqState;

    /// Restore the interrupt state returned by the matching
    /// [`Kernel::irq_disable`].
    fn irq_restore(&self, state: IrqState);

    /// Block the current thread on `token` for at most `timeout_ms`
    /// milliseconds, `0` meaning forever.
    ///
    /// Must be called with interrupts masked. The mask is released while
    /// the thread sleeps and held again on return, so a waker cannot slip
    /// in between the caller's last check and its registration as a
    /// waiter. A timeout is reported as [`SyncError::WouldBlock`]; a wake
    /// through [`Kernel::genwait_wake_all_err`] reports that error.
    fn genwait_wait(&self, token: WaitToken, timeout_ms: u32) -> SyncResult<()>;

    /// Wake the most urgent thread blocked on `token`. Returns whether a
    /// thread was woken.
    fn genwait_wake_one(&self, token: WaitToken) -> bool;

    /// Wake every thread blocked on `token`. Returns how many were woken.
    fn genwait_wake_all(&self, token: WaitToken) -> usize;

    /// Wake every thread blocked on `token`, making their wait fail with
    /// `error`. Returns how many were woken.
    fn genwait_wake_all_err(&self, token: WaitToken, error: SyncError) -> usize;

    /// Current time on the monotonic clock.
    fn now(&self) -> Instant;

    /// Current time on `clock`.
    fn clock_time(&self, clock: ClockId) -> Timespec;

    /// Whether the allocator may be used from the running interrupt.
    fn alloc_irq_safe(&self) -> bool;
}

/// Interrupts masked for the lifetime of the guard.
#[must_use = "interrupts are unmasked again as soon as the guard is dropped"]
pub struct IrqGuard<'k, K: Kernel> {
    kernel: &'k K,
    state: IrqState,
}

impl<'k, K: Kernel> IrqGuard<'k, K> {
    /// Mask interrupts until the guard is dropped.
    pub fn new(kernel: &'k K) -> Self {
        let state = kernel.irq_disable();
        Self { kernel, state }
    }
}

impl<K: Kernel> Drop for IrqGuard<'_, K> {
    fn drop(&mut self) {
        self.kernel.irq_restore(self.state);
    }
}
