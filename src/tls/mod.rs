//! Thread-local storage keys.
//!
//! A [`TlsRegistry`] hands out process-wide keys and remembers an optional
//! destructor per key. The values themselves live in a [`ThreadLocals`]
//! list that the scheduler keeps in each thread's record; a thread only
//! ever touches its own list, except when a key is deleted and every
//! thread's entry for it is dropped.
//!
//! Values are opaque words. `0` plays the role of a null pointer: it can be
//! stored, but destructors are only run for non-zero values.

pub mod registry;

pub use registry::TlsRegistry;

use crate::errors::{SyncError, SyncResult};
use alloc::vec::Vec;
use core::fmt;

/// Destructor run on a thread's value when the thread exits.
pub type Destructor = fn(usize);

/// Number of destructor passes made when a thread exits.
///
/// Destructors may store new values, which are cleaned up by the next pass.
pub const TLS_DESTRUCTOR_ITERATIONS: usize = 4;

/// A TLS key. Valid keys are `1..TlsRegistry::key_next()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TlsKey(u32);

impl TlsKey {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TlsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One value stored by a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsEntry {
    pub key: TlsKey,
    pub value: usize,
    /// Destructor registered for the key when the entry was created.
    pub destructor: Option<Destructor>,
}

/// The key/value list of one thread.
#[derive(Debug, Default)]
pub struct ThreadLocals {
    entries: Vec<TlsEntry>,
}

impl ThreadLocals {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value stored under `key`, if any.
    pub fn get(&self, key: TlsKey) -> Option<usize> {
        self.entries.iter().find(|e| e.key == key).map(|e| e.value)
    }

    /// Overwrite the value of an existing entry. Returns `false` if the
    /// thread has no entry for `key`.
    pub fn replace(&mut self, key: TlsKey, value: usize) -> bool {
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) => {
                entry.value = value;
                true
            }
            None => false,
        }
    }

    /// Add a new entry for a key the thread does not hold yet.
    pub fn insert(&mut self, entry: TlsEntry) -> SyncResult<()> {
        debug_assert!(self.get(entry.key).is_none());
        self.entries
            .try_reserve(1)
            .map_err(|_| SyncError::OutOfMemory)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Drop the entry for `key` without running its destructor.
    pub fn remove(&mut self, key: TlsKey) -> Option<TlsEntry> {
        let index = self.entries.iter().position(|e| e.key == key)?;
        Some(self.entries.swap_remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TlsEntry> {
        self.entries.iter()
    }

    /// Run the destructor of every entry holding a non-zero value, then
    /// free the list. Returns how many destructors ran.
    pub fn run_destructors(self) -> usize {
        let mut ran = 0;
        for entry in self.entries {
            match entry.destructor {
                Some(destructor) if entry.value != 0 => {
                    destructor(entry.value);
                    ran += 1;
                }
                _ => {}
            }
        }
        ran
    }
}

/// Thread-exit cleanup.
///
/// `take` detaches the exiting thread's current list. Destructors run with
/// the list detached, so they may call `setspecific` again; whatever they
/// store is picked up by the next pass, up to
/// [`TLS_DESTRUCTOR_ITERATIONS`] passes. Returns how many destructors ran.
pub fn run_exit_destructors(mut take: impl FnMut() -> ThreadLocals) -> usize {
    let mut ran = 0;
    for _ in 0..TLS_DESTRUCTOR_ITERATIONS {
        let locals = take();
        if locals.is_empty() {
            break;
        }
        ran += locals.run_destructors();
    }
    // Anything still left after the last pass is freed without cleanup.
    drop(take());
    ran
}
