//! Thread identity as seen by the synchronization primitives.
//!
//! The scheduler itself lives outside this crate. The primitives only need
//! to name threads, ask for their priority and state, and record who holds a
//! lock, which may be the running interrupt handler rather than a thread.

use core::fmt;
use core::num::NonZeroU32;

/// Identifier of a kernel thread.
///
/// Identifiers are non-zero and never equal to `u32::MAX`, which is reserved
/// for the interrupt pseudo-owner in packed lock words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(NonZeroU32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ThreadId {
    /// Largest identifier a thread may use.
    pub const MAX: u32 = u32::MAX - 1;

    /// Create a thread ID, rejecting `0` and `u32::MAX`.
    pub const fn new(id: u32) -> Option<Self> {
        if id > Self::MAX {
            return None;
        }
        match NonZeroU32::new(id) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    /// Get the raw ID value.
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

/// Scheduling state of a thread, as reported by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Ready = 0,
    Running = 1,
    Blocked = 2,
    Finished = 3,
}

/// Holder of a lock.
///
/// A lock taken from inside an interrupt handler is owned by the interrupt
/// context itself, not by the thread it preempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    Thread(ThreadId),
    Interrupt,
}

impl Owner {
    const INTERRUPT_CODE: u32 = u32::MAX;

    /// Non-zero code used in packed lock words.
    pub(crate) const fn encode(self) -> u32 {
        match self {
            Owner::Thread(id) => id.get(),
            Owner::Interrupt => Self::INTERRUPT_CODE,
        }
    }

    /// Inverse of [`Owner::encode`]; `0` means "no owner".
    pub(crate) const fn decode(code: u32) -> Option<Self> {
        if code == Self::INTERRUPT_CODE {
            return Some(Owner::Interrupt);
        }
        match ThreadId::new(code) {
            Some(id) => Some(Owner::Thread(id)),
            None => None,
        }
    }

    /// The owning thread, if the owner is not an interrupt.
    pub const fn thread(self) -> Option<ThreadId> {
        match self {
            Owner::Thread(id) => Some(id),
            Owner::Interrupt => None,
        }
    }
}

/// Priority levels for threads.
///
/// Higher values are more urgent. Priority inheritance raises a lock
/// holder to the priority of its most urgent blocked waiter.
pub mod priority {
    /// Idle priority - only runs when nothing else is ready
    pub const IDLE: u8 = 0;

    /// Low priority - background tasks
    pub const LOW: u8 = 64;

    /// Normal priority - default for most threads
    pub const NORMAL: u8 = 128;

    /// High priority - important system tasks
    pub const HIGH: u8 = 192;

    /// Real-time priority - critical system operations
    pub const REALTIME: u8 = 255;
}
