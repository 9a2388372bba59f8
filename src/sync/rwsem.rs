//! Reader/writer semaphore built from two mutexes.
//!
//! `write_mutex` admits one updater at a time: a writer keeps it for as
//! long as it holds the semaphore, a reader only while joining the reader
//! group. `read_mutex` is held by the reader group as a whole, taken by the
//! first reader in and released by the last one out, or by a writer once
//! the group is empty. Both mutexes bring their own priority inheritance
//! and timeout handling.

use super::{Mutex, MutexType};
use crate::errors::{SyncError, SyncResult};
use crate::kernel::Kernel;
use crate::time::{relative_timeout, ClockId, Deadline, Timespec};
use portable_atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Update {
    Read,
    Write,
    Upgrade,
}

/// Many readers or one writer.
pub struct RwSemaphore<'k, K: Kernel> {
    kernel: &'k K,
    read_count: AtomicU32,
    write_mutex: Mutex<'k, K>,
    read_mutex: Mutex<'k, K>,
}

impl<'k, K: Kernel> RwSemaphore<'k, K> {
    /// An unlocked semaphore.
    pub const fn new(kernel: &'k K) -> Self {
        Self {
            kernel,
            read_count: AtomicU32::new(0),
            write_mutex: Mutex::new(kernel, MutexType::Normal),
            read_mutex: Mutex::new(kernel, MutexType::Normal),
        }
    }

    /// Retire the semaphore. Fails with `Busy` while readers or a writer
    /// hold it; afterwards every lock attempt fails with `InvalidArgument`.
    pub fn destroy(&self) -> SyncResult<()> {
        if self.write_mutex.is_locked() || self.read_mutex.is_locked() {
            return Err(SyncError::Busy);
        }
        self.write_mutex.destroy()?;
        self.read_mutex.destroy()
    }

    /// Number of readers currently holding the semaphore.
    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Acquire)
    }

    /// Whether a writer holds, or a reader is joining, the semaphore.
    pub fn write_locked(&self) -> bool {
        self.write_mutex.is_locked()
    }

    /// Join the readers, blocking while a writer holds the semaphore.
    pub fn read_lock(&self) -> SyncResult<()> {
        self.update_timed(0, Update::Read)
    }

    /// [`RwSemaphore::read_lock`] for at most `timeout_ms` milliseconds
    /// (`0` waits forever).
    pub fn read_lock_timed(&self, timeout_ms: u32) -> SyncResult<()> {
        self.update_timed(timeout_ms, Update::Read)
    }

    /// [`RwSemaphore::read_lock`] with an absolute real-time deadline.
    pub fn read_lock_until(&self, abstime: &Timespec) -> SyncResult<()> {
        self.until(abstime, Self::read_trylock, Self::read_lock_timed)
    }

    /// [`RwSemaphore::read_trylock`] inside an interrupt,
    /// [`RwSemaphore::read_lock`] otherwise.
    pub fn read_lock_irqsafe(&self) -> SyncResult<()> {
        if self.kernel.in_interrupt() {
            self.read_trylock()
        } else {
            self.read_lock()
        }
    }

    /// Take exclusive access, blocking until readers and writers are gone.
    pub fn write_lock(&self) -> SyncResult<()> {
        self.update_timed(0, Update::Write)
    }

    /// [`RwSemaphore::write_lock`] for at most `timeout_ms` milliseconds
    /// (`0` waits forever).
    pub fn write_lock_timed(&self, timeout_ms: u32) -> SyncResult<()> {
        self.update_timed(timeout_ms, Update::Write)
    }

    /// [`RwSemaphore::write_lock`] with an absolute real-time deadline.
    pub fn write_lock_until(&self, abstime: &Timespec) -> SyncResult<()> {
        self.until(abstime, Self::write_trylock, Self::write_lock_timed)
    }

    /// [`RwSemaphore::write_trylock`] inside an interrupt,
    /// [`RwSemaphore::write_lock`] otherwise.
    pub fn write_lock_irqsafe(&self) -> SyncResult<()> {
        if self.kernel.in_interrupt() {
            self.write_trylock()
        } else {
            self.write_lock()
        }
    }

    /// Turn the caller's read lock into a write lock.
    ///
    /// The read lock is given up before the write side is complete, so
    /// another writer may get in between. On failure the caller is a
    /// reader again.
    pub fn read_upgrade(&self) -> SyncResult<()> {
        self.update_timed(0, Update::Upgrade)
    }

    /// [`RwSemaphore::read_upgrade`] for at most `timeout_ms` milliseconds.
    pub fn read_upgrade_timed(&self, timeout_ms: u32) -> SyncResult<()> {
        self.update_timed(timeout_ms, Update::Upgrade)
    }

    /// Join the readers without blocking.
    pub fn read_trylock(&self) -> SyncResult<()> {
        self.write_mutex.trylock()?;

        if self.read_count.fetch_add(1, Ordering::AcqRel) == 0 {
            if let Err(err) = self.read_mutex.trylock() {
                self.read_count.fetch_sub(1, Ordering::AcqRel);
                self.write_mutex.unlock()?;
                return Err(err);
            }
        }

        self.write_mutex.unlock()
    }

    /// Take exclusive access without blocking.
    pub fn write_trylock(&self) -> SyncResult<()> {
        self.write_mutex.trylock()?;

        if let Err(err) = self.read_mutex.trylock() {
            self.write_mutex.unlock()?;
            return Err(err);
        }
        Ok(())
    }

    /// Upgrade without blocking; only the sole reader can upgrade.
    pub fn read_tryupgrade(&self) -> SyncResult<()> {
        self.write_mutex.trylock()?;

        // The group lock passes to the writer as is.
        if self
            .read_count
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.write_mutex.unlock()?;
            return Err(SyncError::WouldBlock);
        }
        Ok(())
    }

    /// Leave the reader group.
    ///
    /// # Panics
    ///
    /// If there are no readers.
    pub fn read_unlock(&self) -> SyncResult<()> {
        match self
            .read_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => self.read_mutex.unlock_on_behalf(),
            Ok(_) => {}
            Err(_) => panic!("rwsem read-unlocked without readers"),
        }
        Ok(())
    }

    /// Give up exclusive access.
    pub fn write_unlock(&self) -> SyncResult<()> {
        // The group lock may have been taken by the reader this writer
        // upgraded from, or by an earlier reader of that group.
        self.read_mutex.unlock_on_behalf();
        self.write_mutex.unlock()
    }

    /// Release whichever lock the caller holds, judged by the reader count.
    pub fn unlock(&self) -> SyncResult<()> {
        if self.read_count() > 0 {
            self.read_unlock()
        } else {
            self.write_unlock()
        }
    }

    fn update_timed(&self, timeout_ms: u32, update: Update) -> SyncResult<()> {
        let deadline = Deadline::after(self.kernel.now(), timeout_ms);

        self.write_mutex.lock_timed(timeout_ms)?;

        if update == Update::Read && self.read_count.fetch_add(1, Ordering::AcqRel) != 0 {
            // The group already holds the read lock.
            return self.write_mutex.unlock();
        }

        let remaining = match deadline.remaining(self.kernel.now()) {
            Ok(ms) => ms,
            Err(err) => {
                if update == Update::Read {
                    self.read_count.fetch_sub(1, Ordering::AcqRel);
                }
                self.write_mutex.unlock()?;
                return Err(err);
            }
        };

        if update == Update::Upgrade {
            self.read_unlock()?;
        }

        if let Err(err) = self.read_mutex.lock_timed(remaining) {
            let restored = match update {
                Update::Read => {
                    self.read_count.fetch_sub(1, Ordering::AcqRel);
                    Ok(())
                }
                Update::Upgrade => {
                    if self.read_count.fetch_add(1, Ordering::AcqRel) == 0 {
                        // Holding the write lock keeps everyone else away
                        // from the read lock, so whoever holds it is about
                        // to let it go.
                        self.read_mutex.lock()
                    } else {
                        Ok(())
                    }
                }
                Update::Write => Ok(()),
            };
            self.write_mutex.unlock()?;
            restored?;
            return Err(err);
        }

        if update == Update::Read {
            self.write_mutex.unlock()?;
        }
        Ok(())
    }

    fn until(
        &self,
        abstime: &Timespec,
        try_lock: fn(&Self) -> SyncResult<()>,
        lock_timed: fn(&Self, u32) -> SyncResult<()>,
    ) -> SyncResult<()> {
        abstime.validate()?;
        match try_lock(self) {
            Err(SyncError::WouldBlock) => {}
            other => return other,
        }
        let now = self.kernel.clock_time(ClockId::Realtime);
        lock_timed(self, relative_timeout(abstime, &now)?)
    }
}

impl<K: Kernel> core::fmt::Debug for RwSemaphore<'_, K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RwSemaphore")
            .field("read_count", &self.read_count())
            .field("write_locked", &self.write_locked())
            .finish()
    }
}
