//! Counting semaphore.
//!
//! A negative count is the number of threads blocked in [`Semaphore::wait`].

use crate::errors::{SyncError, SyncResult};
use crate::kernel::{IrqGuard, Kernel, WaitToken};
use portable_atomic::{AtomicBool, AtomicI32, Ordering};

pub struct Semaphore<'k, K: Kernel> {
    kernel: &'k K,
    count: AtomicI32,
    initialized: AtomicBool,
}

impl<'k, K: Kernel> Semaphore<'k, K> {
    /// Create a semaphore holding `count` units. A negative count is
    /// rejected with `InvalidArgument`.
    pub fn init(kernel: &'k K, count: i32) -> SyncResult<Self> {
        if count < 0 {
            return Err(SyncError::InvalidArgument);
        }
        Ok(Self {
            kernel,
            count: AtomicI32::new(count),
            initialized: AtomicBool::new(true),
        })
    }

    /// Retire the semaphore, failing every blocked waiter with
    /// `Unrecoverable`.
    pub fn destroy(&self) -> SyncResult<()> {
        let _irq = IrqGuard::new(self.kernel);
        let woken = self
            .kernel
            .genwait_wake_all_err(self.token(), SyncError::Unrecoverable);
        if woken > 0 {
            log::debug!("semaphore {:#x}: destroyed with {} waiters", self.token().as_raw(), woken);
        }
        self.count.store(0, Ordering::Release);
        self.initialized.store(false, Ordering::Release);
        Ok(())
    }

    /// Current count; negative values count blocked waiters.
    pub fn count(&self) -> i32 {
        self.count.load(Ordering::Acquire)
    }

    /// Take one unit, blocking until one is available.
    pub fn wait(&self) -> SyncResult<()> {
        self.wait_timed(0)
    }

    /// Take one unit, blocking for at most `timeout_ms` milliseconds
    /// (`0` waits forever). Thread context only.
    pub fn wait_timed(&self, timeout_ms: u32) -> SyncResult<()> {
        if self.kernel.in_interrupt() {
            log::warn!("semaphore {:#x}: blocking wait inside an interrupt", self.token().as_raw());
            return Err(SyncError::PermissionDenied);
        }
        self.check_initialized()?;

        let _irq = IrqGuard::new(self.kernel);
        if self.count.fetch_sub(1, Ordering::AcqRel) > 0 {
            return Ok(());
        }

        match self.kernel.genwait_wait(self.token(), timeout_ms) {
            Ok(()) => Ok(()),
            // The semaphore is gone along with the unit we took.
            Err(SyncError::Unrecoverable) => Err(SyncError::Unrecoverable),
            Err(err) => {
                self.count.fetch_add(1, Ordering::AcqRel);
                Err(match err {
                    SyncError::WouldBlock => SyncError::TimedOut,
                    other => other,
                })
            }
        }
    }

    /// Take one unit if one is available right now. Usable from any context.
    pub fn trywait(&self) -> SyncResult<()> {
        self.check_initialized()?;

        let _irq = IrqGuard::new(self.kernel);
        if self.count.load(Ordering::Acquire) <= 0 {
            return Err(SyncError::WouldBlock);
        }
        self.count.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// [`Semaphore::trywait`] inside an interrupt, [`Semaphore::wait`]
    /// otherwise.
    pub fn wait_irqsafe(&self) -> SyncResult<()> {
        if self.kernel.in_interrupt() {
            self.trywait()
        } else {
            self.wait()
        }
    }

    /// Release one unit, handing it to a blocked waiter if there is one.
    ///
    /// Fails with `ResourceExhausted` once the count is at `i32::MAX`.
    pub fn signal(&self) -> SyncResult<()> {
        self.check_initialized()?;

        let _irq = IrqGuard::new(self.kernel);
        let count = self.count.load(Ordering::Acquire);
        if count == i32::MAX {
            return Err(SyncError::ResourceExhausted);
        }
        if count < 0 {
            self.kernel.genwait_wake_one(self.token());
        }
        self.count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn check_initialized(&self) -> SyncResult<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(SyncError::InvalidArgument);
        }
        Ok(())
    }

    fn token(&self) -> WaitToken {
        WaitToken::of(self)
    }
}

impl<K: Kernel> core::fmt::Debug for Semaphore<'_, K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Semaphore")
            .field("count", &self.count())
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .finish()
    }
}
