//! A [`Kernel`] running on a std host.
//!
//! Kernel threads are std threads. The single-core target is modelled by
//! treating the interrupt mask as a reentrant lock owned by at most one
//! thread: while a thread has interrupts masked nobody else can mask them,
//! wake a waiter or leave a wait queue. Everything the scheduler would keep
//! in its thread records (priorities, states, TLS lists, wait queue
//! membership) lives in one `Machine` behind a `parking_lot` mutex, with a
//! condvar signalled on every change.
//!
//! Threads that were not started through [`HostedKernel::spawn`], such as
//! the test harness thread, are adopted on first use.

use crate::errors::{SyncError, SyncResult};
use crate::kernel::{IrqState, Kernel, WaitToken};
use crate::thread::{priority, ThreadId, ThreadState};
use crate::time::{ClockId, Instant, Timespec};
use crate::tls::{self, ThreadLocals};
use core::cmp::Reverse;
use parking_lot::{Condvar, Mutex, MutexGuard};
use portable_atomic::{AtomicU64, Ordering};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::thread::{Scope, ScopedJoinHandle};
use std::time::{Duration as StdDuration, Instant as StdInstant, SystemTime, UNIX_EPOCH};
use std::vec::Vec;

static NEXT_KERNEL_UID: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    /// Kernel thread identity of this std thread, per kernel instance.
    static BINDINGS: RefCell<Vec<(u64, ThreadId)>> = const { RefCell::new(Vec::new()) };
}

fn bound(uid: u64) -> Option<ThreadId> {
    BINDINGS.with(|b| b.borrow().iter().find(|(k, _)| *k == uid).map(|(_, id)| *id))
}

fn bind(uid: u64, id: ThreadId) {
    BINDINGS.with(|b| {
        let mut b = b.borrow_mut();
        b.retain(|(k, _)| *k != uid);
        b.push((uid, id));
    });
}

fn unbind(uid: u64) {
    BINDINGS.with(|b| b.borrow_mut().retain(|(k, _)| *k != uid));
}

/// Hosted kernel configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostedConfig {
    /// Priority given to adopted threads
    pub default_priority: u8,
    /// Answer to [`Kernel::alloc_irq_safe`]
    pub alloc_irq_safe: bool,
}

impl Default for HostedConfig {
    fn default() -> Self {
        Self {
            default_priority: priority::NORMAL,
            alloc_irq_safe: true,
        }
    }
}

#[derive(Debug)]
struct Wait {
    token: WaitToken,
    seq: u64,
    result: Option<SyncResult<()>>,
}

#[derive(Debug)]
struct ThreadRecord {
    base: u8,
    effective: u8,
    state: ThreadState,
    locals: ThreadLocals,
    wait: Option<Wait>,
    requeues: u32,
}

#[derive(Debug)]
struct Machine {
    mask_owner: Option<ThreadId>,
    mask_depth: usize,
    /// Thread running an interrupt handler and the handler nesting depth.
    interrupt: Option<(ThreadId, usize)>,
    threads: BTreeMap<ThreadId, ThreadRecord>,
    next_thread: u32,
    next_seq: u64,
    alloc_irq_safe: bool,
}

impl Machine {
    fn register(&mut self, priority: u8, state: ThreadState) -> ThreadId {
        self.next_thread += 1;
        let Some(id) = ThreadId::new(self.next_thread) else {
            panic!("hosted kernel ran out of thread ids");
        };
        self.threads.insert(
            id,
            ThreadRecord {
                base: priority,
                effective: priority,
                state,
                locals: ThreadLocals::new(),
                wait: None,
                requeues: 0,
            },
        );
        id
    }

    fn set_state(&mut self, id: ThreadId, state: ThreadState) {
        if let Some(record) = self.threads.get_mut(&id) {
            record.state = state;
        }
    }

    fn mask_free_for(&self, id: ThreadId) -> bool {
        self.mask_owner.map_or(true, |owner| owner == id)
    }

    /// Complete the waits of up to `limit` threads blocked on `token`, most
    /// urgent first and FIFO within a priority.
    fn wake(&mut self, token: WaitToken, limit: usize, result: SyncResult<()>) -> usize {
        let mut waiting: Vec<(Reverse<u8>, u64, ThreadId)> = self
            .threads
            .iter()
            .filter_map(|(id, record)| match &record.wait {
                Some(wait) if wait.token == token && wait.result.is_none() => {
                    Some((Reverse(record.effective), wait.seq, *id))
                }
                _ => None,
            })
            .collect();
        waiting.sort_unstable();

        let mut woken = 0;
        for (_, _, id) in waiting.into_iter().take(limit) {
            if let Some(record) = self.threads.get_mut(&id) {
                if let Some(wait) = record.wait.as_mut() {
                    wait.result = Some(result);
                }
                record.state = ThreadState::Ready;
                woken += 1;
            }
        }
        woken
    }
}

/// Releases the interrupt context when an interrupt handler returns or
/// unwinds.
struct InterruptFrame<'a> {
    kernel: &'a HostedKernel,
    state: IrqState,
}

impl Drop for InterruptFrame<'_> {
    fn drop(&mut self) {
        {
            let mut m = self.kernel.machine.lock();
            m.interrupt = match m.interrupt {
                Some((thread, depth)) if depth > 1 => Some((thread, depth - 1)),
                _ => None,
            };
        }
        self.kernel.irq_restore(self.state);
    }
}

/// Runs thread-exit cleanup when a spawned thread returns or unwinds.
struct ThreadExit<'a> {
    kernel: &'a HostedKernel,
    id: ThreadId,
}

impl Drop for ThreadExit<'_> {
    fn drop(&mut self) {
        let ran = tls::run_exit_destructors(|| self.kernel.take_locals(self.id));

        {
            let mut m = self.kernel.machine.lock();
            m.threads.remove(&self.id);
            if m.mask_owner == Some(self.id) {
                log::warn!("hosted: thread {} exited with interrupts masked", self.id);
                m.mask_owner = None;
                m.mask_depth = 0;
            }
        }
        self.kernel.changed.notify_all();
        unbind(self.kernel.uid);
        log::trace!("hosted: thread {} exited, {} tls destructors run", self.id, ran);
    }
}

/// A kernel thread started by [`HostedKernel::spawn`].
#[derive(Debug)]
pub struct HostedThread<'scope, T> {
    id: ThreadId,
    handle: ScopedJoinHandle<'scope, T>,
}

impl<T> HostedThread<'_, T> {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Wait for the thread to finish, re-raising its panic if it panicked.
    pub fn join(self) -> T {
        match self.handle.join() {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Std-hosted implementation of [`Kernel`].
pub struct HostedKernel {
    uid: u64,
    config: HostedConfig,
    machine: Mutex<Machine>,
    changed: Condvar,
    epoch: StdInstant,
}

impl Default for HostedKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for HostedKernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostedKernel")
            .field("uid", &self.uid)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HostedKernel {
    pub fn new() -> Self {
        Self::with_config(HostedConfig::default())
    }

    pub fn with_config(config: HostedConfig) -> Self {
        Self {
            uid: NEXT_KERNEL_UID.fetch_add(1, Ordering::Relaxed),
            config,
            machine: Mutex::new(Machine {
                mask_owner: None,
                mask_depth: 0,
                interrupt: None,
                threads: BTreeMap::new(),
                next_thread: 0,
                next_seq: 0,
                alloc_irq_safe: config.alloc_irq_safe,
            }),
            changed: Condvar::new(),
            epoch: StdInstant::now(),
        }
    }

    /// Start `f` as a kernel thread of the given priority on `scope`.
    ///
    /// The thread is registered before this returns, so its id can be
    /// waited on right away. When `f` finishes the thread's TLS destructors
    /// run and its record is dropped.
    pub fn spawn<'scope, 'env, T, F>(
        &'env self,
        scope: &'scope Scope<'scope, 'env>,
        priority: u8,
        f: F,
    ) -> HostedThread<'scope, T>
    where
        F: FnOnce() -> T + Send + 'scope,
        T: Send + 'scope,
    {
        let id = self.machine.lock().register(priority, ThreadState::Ready);
        log::trace!("hosted: spawning thread {} at priority {}", id, priority);

        let handle = scope.spawn(move || {
            bind(self.uid, id);
            self.machine.lock().set_state(id, ThreadState::Running);
            let _exit = ThreadExit { kernel: self, id };
            f()
        });
        HostedThread { id, handle }
    }

    /// Run `f` as an interrupt handler preempting the calling thread.
    pub fn raise_interrupt<R>(&self, f: impl FnOnce() -> R) -> R {
        let me = self.current_thread();
        let state = self.irq_disable();
        {
            let mut m = self.machine.lock();
            m.interrupt = match m.interrupt {
                Some((thread, depth)) => Some((thread, depth + 1)),
                None => Some((me, 1)),
            };
        }
        let _frame = InterruptFrame { kernel: self, state };
        f()
    }

    /// Whether the calling thread has interrupts masked.
    pub fn irq_masked(&self) -> bool {
        let me = self.current_thread();
        self.machine.lock().mask_owner == Some(me)
    }

    pub fn set_alloc_irq_safe(&self, safe: bool) {
        self.machine.lock().alloc_irq_safe = safe;
    }

    /// Set both the base and the effective priority of `thread`.
    pub fn set_base_priority(&self, thread: ThreadId, priority: u8) {
        if let Some(record) = self.machine.lock().threads.get_mut(&thread) {
            record.base = priority;
            record.effective = priority;
        }
    }

    /// How often `thread` was repositioned in the run queue.
    pub fn requeues(&self, thread: ThreadId) -> u32 {
        self.machine
            .lock()
            .threads
            .get(&thread)
            .map_or(0, |record| record.requeues)
    }

    /// Number of registered threads, adopted ones included.
    pub fn live_threads(&self) -> usize {
        self.machine.lock().threads.len()
    }

    /// Block until `thread` sits in a wait queue.
    ///
    /// # Panics
    ///
    /// If the thread does not block within ten seconds.
    pub fn wait_until_blocked(&self, thread: ThreadId) {
        let give_up = StdInstant::now() + StdDuration::from_secs(10);
        let mut m = self.machine.lock();
        loop {
            let blocked = m.threads.get(&thread).is_some_and(|record| {
                record.state == ThreadState::Blocked
                    && record.wait.as_ref().is_some_and(|w| w.result.is_none())
            });
            if blocked {
                return;
            }
            if self.changed.wait_until(&mut m, give_up).timed_out() {
                panic!("thread {} never blocked", thread);
            }
        }
    }

    fn take_locals(&self, id: ThreadId) -> ThreadLocals {
        self.machine
            .lock()
            .threads
            .get_mut(&id)
            .map(|record| core::mem::take(&mut record.locals))
            .unwrap_or_default()
    }

    /// Wait until the mask is free for `me` and take it at `depth`.
    fn take_mask(&self, m: &mut MutexGuard<'_, Machine>, me: ThreadId, depth: usize) {
        if !m.mask_free_for(me) {
            m.set_state(me, ThreadState::Ready);
            while !m.mask_free_for(me) {
                self.changed.wait(m);
            }
        }
        m.set_state(me, ThreadState::Running);
        m.mask_owner = Some(me);
        m.mask_depth = depth;
    }
}

impl Kernel for HostedKernel {
    fn current_thread(&self) -> ThreadId {
        if let Some(id) = bound(self.uid) {
            return id;
        }
        let id = self
            .machine
            .lock()
            .register(self.config.default_priority, ThreadState::Running);
        bind(self.uid, id);
        log::trace!("hosted: adopted thread {}", id);
        id
    }

    fn in_interrupt(&self) -> bool {
        let me = self.current_thread();
        self.machine
            .lock()
            .interrupt
            .is_some_and(|(thread, _)| thread == me)
    }

    fn priority(&self, thread: ThreadId) -> u8 {
        self.machine
            .lock()
            .threads
            .get(&thread)
            .map_or(self.config.default_priority, |record| record.effective)
    }

    fn set_priority(&self, thread: ThreadId, priority: u8) {
        if let Some(record) = self.machine.lock().threads.get_mut(&thread) {
            record.effective = priority;
        }
    }

    fn restore_priority(&self, thread: ThreadId) {
        // The thread may have exited since it took the lock.
        if let Some(record) = self.machine.lock().threads.get_mut(&thread) {
            record.effective = record.base;
        }
    }

    fn thread_state(&self, thread: ThreadId) -> ThreadState {
        self.machine
            .lock()
            .threads
            .get(&thread)
            .map_or(ThreadState::Finished, |record| record.state)
    }

    fn requeue(&self, thread: ThreadId) {
        if let Some(record) = self.machine.lock().threads.get_mut(&thread) {
            record.requeues += 1;
        }
    }

    fn for_each_thread(&self, f: &mut dyn FnMut(ThreadId, &mut ThreadLocals)) {
        let mut m = self.machine.lock();
        for (id, record) in m.threads.iter_mut() {
            f(*id, &mut record.locals);
        }
    }

    fn with_current_locals<R>(&self, f: impl FnOnce(&mut ThreadLocals) -> R) -> R {
        let me = self.current_thread();
        let mut m = self.machine.lock();
        match m.threads.get_mut(&me) {
            Some(record) => f(&mut record.locals),
            None => f(&mut ThreadLocals::new()),
        }
    }

    fn irq_disable(&self) -> IrqState {
        let me = self.current_thread();
        let mut m = self.machine.lock();
        let previous = if m.mask_owner == Some(me) { m.mask_depth } else { 0 };
        self.take_mask(&mut m, me, previous + 1);
        IrqState(previous)
    }

    fn irq_restore(&self, state: IrqState) {
        let me = self.current_thread();
        let mut m = self.machine.lock();
        assert_eq!(m.mask_owner, Some(me), "interrupt mask restored by a thread that does not hold it");
        m.mask_depth = state.0;
        if state.0 == 0 {
            m.mask_owner = None;
            drop(m);
            self.changed.notify_all();
        }
    }

    fn genwait_wait(&self, token: WaitToken, timeout_ms: u32) -> SyncResult<()> {
        let me = self.current_thread();
        let mut m = self.machine.lock();
        assert_eq!(m.mask_owner, Some(me), "genwait_wait called with interrupts enabled");
        if m.interrupt.is_some_and(|(thread, _)| thread == me) {
            return Err(SyncError::PermissionDenied);
        }

        let deadline = (timeout_ms != 0)
            .then(|| StdInstant::now() + StdDuration::from_millis(u64::from(timeout_ms)));
        let seq = m.next_seq;
        m.next_seq += 1;
        let depth = m.mask_depth;

        match m.threads.get_mut(&me) {
            Some(record) => {
                record.state = ThreadState::Blocked;
                record.wait = Some(Wait {
                    token,
                    seq,
                    result: None,
                });
            }
            None => panic!("genwait_wait by unknown thread {}", me),
        }

        // Queued and unmasked in one step: no wake can slip in between.
        m.mask_owner = None;
        m.mask_depth = 0;
        self.changed.notify_all();

        loop {
            if m.mask_owner.is_none() {
                let expired = deadline.is_some_and(|d| StdInstant::now() >= d);
                let finished = m.threads.get_mut(&me).and_then(|record| {
                    let result = record.wait.as_ref().and_then(|w| w.result);
                    match result {
                        Some(result) => Some(result),
                        None if expired => Some(Err(SyncError::WouldBlock)),
                        None => None,
                    }
                });
                if let Some(result) = finished {
                    if let Some(record) = m.threads.get_mut(&me) {
                        record.wait = None;
                    }
                    self.take_mask(&mut m, me, depth);
                    return result;
                }
            }

            match deadline {
                Some(d) if StdInstant::now() < d => {
                    self.changed.wait_until(&mut m, d);
                }
                _ => self.changed.wait(&mut m),
            }
        }
    }

    fn genwait_wake_one(&self, token: WaitToken) -> bool {
        self.wake(token, 1, Ok(())) > 0
    }

    fn genwait_wake_all(&self, token: WaitToken) -> usize {
        self.wake(token, usize::MAX, Ok(()))
    }

    fn genwait_wake_all_err(&self, token: WaitToken, error: SyncError) -> usize {
        self.wake(token, usize::MAX, Err(error))
    }

    fn now(&self) -> Instant {
        let nanos = self.epoch.elapsed().as_nanos();
        Instant::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    fn clock_time(&self, clock: ClockId) -> Timespec {
        let since = match clock {
            ClockId::Realtime => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default(),
            ClockId::Monotonic => self.epoch.elapsed(),
        };
        Timespec::new(
            i64::try_from(since.as_secs()).unwrap_or(i64::MAX),
            i64::from(since.subsec_nanos()),
        )
    }

    fn alloc_irq_safe(&self) -> bool {
        self.machine.lock().alloc_irq_safe
    }
}

impl HostedKernel {
    fn wake(&self, token: WaitToken, limit: usize, result: SyncResult<()>) -> usize {
        let state = self.irq_disable();
        let woken = self.machine.lock().wake(token, limit, result);
        if woken > 0 {
            self.changed.notify_all();
        }
        self.irq_restore(state);
        woken
    }
}
