//! Key allocation and the destructor table.

use super::{Destructor, ThreadLocals, TlsEntry, TlsKey};
use crate::errors::{SyncError, SyncResult};
use crate::kernel::{IrqGuard, Kernel};
use crate::sync::{Mutex, MutexGuard, MutexType};
use crate::thread::ThreadId;
use alloc::vec::Vec;
use portable_atomic::{AtomicU32, Ordering};

/// Process-wide TLS key registry.
///
/// Keys are never reused. Deleting a key drops every thread's value for it
/// without running destructors; using a deleted key afterwards is allowed
/// but its values are no longer cleaned up at thread exit.
pub struct TlsRegistry<'k, K: Kernel> {
    kernel: &'k K,
    next_key: AtomicU32,
    /// Serializes destructor table updates. Interrupt handlers may only
    /// touch the table while nobody holds this.
    lock: Mutex<'k, K>,
    destructors: spin::Mutex<Vec<(TlsKey, Destructor)>>,
}

impl<'k, K: Kernel> TlsRegistry<'k, K> {
    pub const fn new(kernel: &'k K) -> Self {
        Self {
            kernel,
            next_key: AtomicU32::new(1),
            lock: Mutex::new(kernel, MutexType::Normal),
            destructors: spin::Mutex::new(Vec::new()),
        }
    }

    /// The key the next [`TlsRegistry::key_create`] will return.
    pub fn key_next(&self) -> TlsKey {
        TlsKey::from_raw(self.next_key.load(Ordering::Acquire))
    }

    /// Allocate a new key, remembering `destructor` for thread exit.
    ///
    /// From an interrupt handler a key with a destructor can only be created
    /// when the allocator is interrupt-safe and no thread is in the middle
    /// of updating the table; otherwise this fails with `PermissionDenied`.
    pub fn key_create(&self, destructor: Option<Destructor>) -> SyncResult<TlsKey> {
        if self.kernel.in_interrupt() && destructor.is_some() && !self.table_usable_from_irq() {
            return Err(SyncError::PermissionDenied);
        }

        let Some(destructor) = destructor else {
            let key = self.issue_key()?;
            log::debug!("tls: created key {}", key);
            return Ok(key);
        };

        let _held = self.lock_table()?;
        let mut table = self.destructors.lock();
        table.try_reserve(1).map_err(|_| SyncError::OutOfMemory)?;

        let key = self.issue_key()?;
        table.push((key, destructor));
        log::debug!("tls: created key {} with destructor", key);
        Ok(key)
    }

    /// Delete `key` and every thread's value for it.
    ///
    /// Destructors are not run. Fails with `InvalidArgument` for a key that
    /// was never handed out and with `PermissionDenied` when the table
    /// cannot be touched right now.
    pub fn key_delete(&self, key: TlsKey) -> SyncResult<()> {
        let _irq = IrqGuard::new(self.kernel);

        self.check_key(key)?;
        if !self.kernel.alloc_irq_safe() || self.lock.is_locked() {
            return Err(SyncError::PermissionDenied);
        }

        let mut dropped = 0usize;
        self.kernel.for_each_thread(&mut |_: ThreadId, locals: &mut ThreadLocals| {
            if locals.remove(key).is_some() {
                dropped += 1;
            }
        });

        let _held = self.lock_table()?;
        self.destructors.lock().retain(|(k, _)| *k != key);
        log::debug!("tls: deleted key {} ({} values dropped)", key, dropped);
        Ok(())
    }

    /// The current thread's value for `key`, or `None` if it never set one.
    pub fn getspecific(&self, key: TlsKey) -> Option<usize> {
        self.kernel.with_current_locals(|locals| locals.get(key))
    }

    /// Store `value` under `key` for the current thread.
    pub fn setspecific(&self, key: TlsKey, value: usize) -> SyncResult<()> {
        self.check_key(key)?;

        if self.kernel.with_current_locals(|locals| locals.replace(key, value)) {
            return Ok(());
        }

        if self.kernel.in_interrupt() && !self.table_usable_from_irq() {
            return Err(SyncError::PermissionDenied);
        }

        let destructor = self.destructor(key)?;
        self.kernel.with_current_locals(|locals| {
            locals.insert(TlsEntry {
                key,
                value,
                destructor,
            })
        })
    }

    /// Drop the destructor table. Proceeds even if the table lock cannot be
    /// taken.
    pub fn shutdown(&self) {
        let held = self.lock_table().ok();
        if held.is_none() {
            log::warn!("tls: shutting down with the destructor table busy");
        }
        let mut table = self.destructors.lock();
        table.clear();
        table.shrink_to_fit();
    }

    /// Hand out the next key. The counter never wraps back to the invalid
    /// key 0.
    fn issue_key(&self) -> SyncResult<TlsKey> {
        self.next_key
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| next.checked_add(1))
            .map(TlsKey::from_raw)
            .map_err(|_| SyncError::ResourceExhausted)
    }

    fn check_key(&self, key: TlsKey) -> SyncResult<()> {
        if key.as_raw() < 1 || key >= self.key_next() {
            return Err(SyncError::InvalidArgument);
        }
        Ok(())
    }

    fn table_usable_from_irq(&self) -> bool {
        self.kernel.alloc_irq_safe() && !self.lock.is_locked()
    }

    fn lock_table(&self) -> SyncResult<MutexGuard<'_, 'k, K>> {
        // Inside an interrupt this is a trylock, which only fails if a
        // thread grabbed the table after the caller's check.
        self.lock
            .lock_irqsafe_scoped()
            .map_err(|_| SyncError::PermissionDenied)
    }

    fn destructor(&self, key: TlsKey) -> SyncResult<Option<Destructor>> {
        let _held = self.lock_table()?;
        let table = self.destructors.lock();
        Ok(table.iter().find(|(k, _)| *k == key).map(|(_, d)| *d))
    }
}
