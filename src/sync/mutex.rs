//! Mutual exclusion lock with priority inheritance.
//!
//! Ownership and recursion count share one atomic word, so a lock is taken
//! with a single compare-and-swap and there is no window where the holder is
//! set but the count is not. The high half of the word is the owner code
//! (see [`Owner`]), the low half the recursion count.
//!
//! A blocked locker lends its priority to the holder before it sleeps, and
//! the holder drops back to its base priority when it releases the lock.

use crate::errors::{SyncError, SyncResult};
use crate::kernel::{IrqGuard, Kernel, WaitToken};
use crate::thread::{Owner, ThreadId, ThreadState};
use crate::time::{relative_timeout, ClockId, Deadline, Timespec};
use core::fmt;
use portable_atomic::{AtomicU64, AtomicU8, Ordering};

/// Largest recursion count of a recursive mutex.
pub const MAX_RECURSION: u32 = i32::MAX as u32;

/// Flavour of a mutex, fixed at init time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MutexType {
    /// Relocking by the holder deadlocks
    #[default]
    Normal = 0,
    /// Relocking by the holder fails with `WouldDeadlock`
    ErrorCheck = 1,
    /// Relocking by the holder nests; each lock needs its own unlock
    Recursive = 2,
}

/// Type value of a destroyed mutex, outside the valid range.
const DESTROYED: u8 = 0xFF;

const UNLOCKED: u64 = 0;

impl MutexType {
    const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(MutexType::Normal),
            1 => Some(MutexType::ErrorCheck),
            2 => Some(MutexType::Recursive),
            _ => None,
        }
    }
}

impl TryFrom<u32> for MutexType {
    type Error = SyncError;

    fn try_from(raw: u32) -> SyncResult<Self> {
        u8::try_from(raw)
            .ok()
            .and_then(MutexType::from_raw)
            .ok_or(SyncError::InvalidArgument)
    }
}

#[inline]
fn pack(owner: Owner, count: u32) -> u64 {
    (u64::from(owner.encode()) << 32) | u64::from(count)
}

#[inline]
fn unpack(word: u64) -> (Option<Owner>, u32) {
    (Owner::decode((word >> 32) as u32), word as u32)
}

/// A sleeping lock owned by a thread or by the running interrupt.
pub struct Mutex<'k, K: Kernel> {
    kernel: &'k K,
    kind: AtomicU8,
    state: AtomicU64,
}

impl<'k, K: Kernel> Mutex<'k, K> {
    /// Create an unlocked mutex.
    pub const fn new(kernel: &'k K, kind: MutexType) -> Self {
        Self {
            kernel,
            kind: AtomicU8::new(kind as u8),
            state: AtomicU64::new(UNLOCKED),
        }
    }

    /// Create an unlocked mutex from a raw type value, failing with
    /// `InvalidArgument` for values that name no mutex type.
    pub fn init(kernel: &'k K, raw_type: u32) -> SyncResult<Self> {
        Ok(Self::new(kernel, MutexType::try_from(raw_type)?))
    }

    /// The mutex type, or `InvalidArgument` once destroyed.
    pub fn kind(&self) -> SyncResult<MutexType> {
        MutexType::from_raw(self.kind.load(Ordering::Acquire)).ok_or(SyncError::InvalidArgument)
    }

    /// Retire the mutex. Fails with `Busy` while it is held; afterwards
    /// every lock attempt fails with `InvalidArgument`.
    pub fn destroy(&self) -> SyncResult<()> {
        let _irq = IrqGuard::new(self.kernel);
        self.kind()?;
        if self.state.load(Ordering::Acquire) != UNLOCKED {
            return Err(SyncError::Busy);
        }
        self.kind.store(DESTROYED, Ordering::Release);
        Ok(())
    }

    /// Whether anyone holds the lock.
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) != UNLOCKED
    }

    /// Current holder of the lock.
    pub fn holder(&self) -> Option<Owner> {
        unpack(self.state.load(Ordering::Acquire)).0
    }

    /// Recursion count; `0` when unlocked.
    pub fn count(&self) -> u32 {
        unpack(self.state.load(Ordering::Acquire)).1
    }

    /// Block until the lock is acquired. Thread context only.
    pub fn lock(&self) -> SyncResult<()> {
        self.lock_timed(0)
    }

    /// Take the lock without blocking. Usable from interrupt handlers,
    /// where the lock is owned by the interrupt context.
    pub fn trylock(&self) -> SyncResult<()> {
        self.try_acquire(self.caller())
    }

    /// [`Mutex::trylock`] inside an interrupt, [`Mutex::lock`] otherwise.
    pub fn lock_irqsafe(&self) -> SyncResult<()> {
        if self.kernel.in_interrupt() {
            self.trylock()
        } else {
            self.lock()
        }
    }

    /// Block for at most `timeout_ms` milliseconds (`0` waits forever).
    pub fn lock_timed(&self, timeout_ms: u32) -> SyncResult<()> {
        if self.kernel.in_interrupt() {
            log::warn!("mutex {:#x}: blocking lock inside an interrupt", self.token().as_raw());
            return Err(SyncError::PermissionDenied);
        }

        let me = self.kernel.current_thread();
        match self.try_acquire(Owner::Thread(me)) {
            Err(SyncError::WouldBlock) => {}
            other => return other,
        }

        let _irq = IrqGuard::new(self.kernel);
        let deadline = Deadline::after(self.kernel.now(), timeout_ms);
        let mut timeout = timeout_ms;

        // The holder may have let go between the fast path and masking.
        match self.try_acquire(Owner::Thread(me)) {
            Err(SyncError::WouldBlock) => {}
            other => return other,
        }

        loop {
            self.inherit_priority(me);

            if self.kernel.genwait_wait(self.token(), timeout).is_err() {
                return Err(SyncError::TimedOut);
            }

            match self.try_acquire(Owner::Thread(me)) {
                Err(SyncError::WouldBlock) => {}
                other => return other,
            }

            timeout = deadline.remaining(self.kernel.now())?;
        }
    }

    /// Lock with an absolute real-time deadline.
    ///
    /// A lock that is free right now is taken even if the deadline has
    /// passed; otherwise an expired deadline fails with `TimedOut` without
    /// blocking.
    pub fn lock_until(&self, abstime: &Timespec) -> SyncResult<()> {
        self.kind()?;
        abstime.validate()?;

        match self.trylock() {
            Err(SyncError::WouldBlock) => {}
            other => return other,
        }

        let now = self.kernel.clock_time(ClockId::Realtime);
        self.lock_timed(relative_timeout(abstime, &now)?)
    }

    /// Release one level of ownership.
    ///
    /// Unlocking a mutex the caller does not hold is a bug and panics,
    /// except for error-checking mutexes, which report `NotOwner`.
    pub fn unlock(&self) -> SyncResult<()> {
        let caller = self.caller();
        let (holder, count) = unpack(self.state.load(Ordering::Acquire));

        if holder != Some(caller) || count == 0 {
            if self.kind() == Ok(MutexType::ErrorCheck) {
                return Err(SyncError::NotOwner);
            }
            panic!("mutex unlocked by {:?} while held by {:?}", caller, holder);
        }

        if count > 1 {
            // Only the holder touches a held lock word.
            self.state.store(pack(caller, count - 1), Ordering::Release);
            return Ok(());
        }

        self.release(caller);
        Ok(())
    }

    /// Lock, returning a guard that unlocks on drop.
    pub fn lock_scoped(&self) -> SyncResult<MutexGuard<'_, 'k, K>> {
        self.lock()?;
        Ok(MutexGuard { mutex: self })
    }

    /// [`Mutex::lock_irqsafe`], returning a guard that unlocks on drop.
    pub fn lock_irqsafe_scoped(&self) -> SyncResult<MutexGuard<'_, 'k, K>> {
        self.lock_irqsafe()?;
        Ok(MutexGuard { mutex: self })
    }

    /// Release a lock taken by some other member of a group, such as the
    /// reader side of an rw-semaphore, where the last reader out releases
    /// what the first reader in acquired.
    pub(crate) fn unlock_on_behalf(&self) {
        let (holder, count) = unpack(self.state.load(Ordering::Acquire));
        let Some(holder) = holder else {
            panic!("group lock released while unlocked");
        };
        debug_assert_eq!(count, 1);
        self.release(holder);
    }

    pub(crate) fn token(&self) -> WaitToken {
        WaitToken::of(self)
    }

    fn caller(&self) -> Owner {
        if self.kernel.in_interrupt() {
            Owner::Interrupt
        } else {
            Owner::Thread(self.kernel.current_thread())
        }
    }

    fn try_acquire(&self, owner: Owner) -> SyncResult<()> {
        let kind = self.kind()?;
        let mut current = self.state.load(Ordering::Relaxed);

        loop {
            let next = match unpack(current) {
                (None, _) => pack(owner, 1),
                (Some(holder), count) if holder == owner => match kind {
                    MutexType::Recursive if count >= MAX_RECURSION => {
                        return Err(SyncError::ResourceExhausted)
                    }
                    MutexType::Recursive => pack(owner, count + 1),
                    MutexType::ErrorCheck => return Err(SyncError::WouldDeadlock),
                    MutexType::Normal => return Err(SyncError::WouldBlock),
                },
                (Some(_), _) => return Err(SyncError::WouldBlock),
            };

            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Raise the holder to `waiter`'s priority if the holder is less urgent.
    fn inherit_priority(&self, waiter: ThreadId) {
        let Some(Owner::Thread(holder)) = self.holder() else {
            return;
        };
        if holder == waiter {
            return;
        }

        let wanted = self.kernel.priority(waiter);
        if self.kernel.priority(holder) < wanted {
            log::trace!("mutex {:#x}: boosting thread {} to {}", self.token().as_raw(), holder, wanted);
            self.kernel.set_priority(holder, wanted);
            if self.kernel.thread_state(holder) == ThreadState::Ready {
                self.kernel.requeue(holder);
            }
        }
    }

    fn release(&self, holder: Owner) {
        let _irq = IrqGuard::new(self.kernel);
        self.state.store(UNLOCKED, Ordering::Release);
        if let Owner::Thread(thread) = holder {
            self.kernel.restore_priority(thread);
        }
        self.kernel.genwait_wake_one(self.token());
    }
}

impl<K: Kernel> fmt::Debug for Mutex<'_, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (holder, count) = unpack(self.state.load(Ordering::Relaxed));
        f.debug_struct("Mutex")
            .field("kind", &self.kind())
            .field("holder", &holder)
            .field("count", &count)
            .finish()
    }
}

/// Unlocks its mutex when dropped.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, 'k, K: Kernel> {
    mutex: &'a Mutex<'k, K>,
}

impl<'k, K: Kernel> MutexGuard<'_, 'k, K> {
    pub fn mutex(&self) -> &Mutex<'k, K> {
        self.mutex
    }
}

impl<K: Kernel> Drop for MutexGuard<'_, '_, K> {
    fn drop(&mut self) {
        // The guard owns one level of the lock, so this cannot fail.
        let _ = self.mutex.unlock();
    }
}
