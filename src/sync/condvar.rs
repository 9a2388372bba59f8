//! Condition variable.

use super::Mutex;
use crate::errors::{SyncError, SyncResult};
use crate::kernel::{IrqGuard, Kernel, WaitToken};
use crate::time::{relative_timeout, ClockId, Timespec};

/// Condition variable attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CondAttr {
    /// Clock absolute deadlines passed to [`CondVar::timedwait`] refer to.
    pub clock: ClockId,
}

pub struct CondVar<'k, K: Kernel> {
    kernel: &'k K,
    clock: ClockId,
}

impl<'k, K: Kernel> CondVar<'k, K> {
    /// A condition variable timed against the real-time clock.
    pub const fn new(kernel: &'k K) -> Self {
        Self {
            kernel,
            clock: ClockId::Realtime,
        }
    }

    pub fn init(kernel: &'k K, attr: Option<&CondAttr>) -> Self {
        Self {
            kernel,
            clock: attr.map(|a| a.clock).unwrap_or_default(),
        }
    }

    pub fn clock(&self) -> ClockId {
        self.clock
    }

    /// Wait until signalled. See [`CondVar::wait_timed`].
    pub fn wait(&self, mutex: &Mutex<'_, K>) -> SyncResult<()> {
        self.wait_timed(mutex, 0)
    }

    /// Release `mutex`, wait for a signal for at most `timeout_ms`
    /// milliseconds (`0` waits forever), then take `mutex` again.
    ///
    /// The caller must hold `mutex` exactly once. Interrupts stay masked
    /// from the unlock until the thread is queued, so a signal sent after
    /// the mutex is released always finds the waiter. The mutex is held
    /// again when this returns, whatever the outcome of the wait.
    pub fn wait_timed(&self, mutex: &Mutex<'_, K>, timeout_ms: u32) -> SyncResult<()> {
        if self.kernel.in_interrupt() {
            log::warn!("condvar {:#x}: wait inside an interrupt", self.token().as_raw());
            return Err(SyncError::PermissionDenied);
        }

        let woke = {
            let _irq = IrqGuard::new(self.kernel);
            mutex.unlock()?;
            self.kernel.genwait_wait(self.token(), timeout_ms)
        };

        mutex.lock()?;
        woke.map_err(|err| match err {
            SyncError::WouldBlock => SyncError::TimedOut,
            other => other,
        })
    }

    /// Wait with an absolute deadline on this condition variable's clock.
    ///
    /// A deadline that has already passed fails with `TimedOut` at once,
    /// leaving `mutex` locked.
    pub fn timedwait(&self, mutex: &Mutex<'_, K>, abstime: &Timespec) -> SyncResult<()> {
        abstime.validate()?;
        let now = self.kernel.clock_time(self.clock);
        let timeout = relative_timeout(abstime, &now)?;
        self.wait_timed(mutex, timeout)
    }

    /// Wake one waiter, if any.
    pub fn signal(&self) {
        let _irq = IrqGuard::new(self.kernel);
        self.kernel.genwait_wake_one(self.token());
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        let _irq = IrqGuard::new(self.kernel);
        self.kernel.genwait_wake_all(self.token());
    }

    fn token(&self) -> WaitToken {
        WaitToken::of(self)
    }
}

impl<K: Kernel> core::fmt::Debug for CondVar<'_, K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CondVar").field("clock", &self.clock).finish()
    }
}
