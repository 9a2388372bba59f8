//! Test helper utilities and common functionality.

use portable_atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration as StdDuration, Instant as StdInstant};

/// Counts threads inside a critical section and remembers any overlap.
pub(crate) struct ExclusionProbe {
    inside: AtomicUsize,
    violations: AtomicUsize,
    entries: AtomicU64,
}

impl ExclusionProbe {
    pub(crate) const fn new() -> Self {
        Self {
            inside: AtomicUsize::new(0),
            violations: AtomicUsize::new(0),
            entries: AtomicU64::new(0),
        }
    }

    /// Run `f` as the critical section.
    pub(crate) fn section<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.inside.fetch_add(1, Ordering::SeqCst) != 0 {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.entries.fetch_add(1, Ordering::Relaxed);
        let result = f();
        self.inside.fetch_sub(1, Ordering::SeqCst);
        result
    }

    pub(crate) fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    pub(crate) fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }
}

/// Tracks readers and writers of a reader/writer lock.
pub(crate) struct RwProbe {
    readers: AtomicUsize,
    writers: AtomicUsize,
    max_readers: AtomicUsize,
    violations: AtomicUsize,
}

impl RwProbe {
    pub(crate) const fn new() -> Self {
        Self {
            readers: AtomicUsize::new(0),
            writers: AtomicUsize::new(0),
            max_readers: AtomicUsize::new(0),
            violations: AtomicUsize::new(0),
        }
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce() -> R) -> R {
        let readers = self.readers.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_readers.fetch_max(readers, Ordering::SeqCst);
        if self.writers.load(Ordering::SeqCst) != 0 {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        let result = f();
        self.readers.fetch_sub(1, Ordering::SeqCst);
        result
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.writers.fetch_add(1, Ordering::SeqCst) != 0 || self.readers.load(Ordering::SeqCst) != 0 {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        let result = f();
        self.writers.fetch_sub(1, Ordering::SeqCst);
        result
    }

    pub(crate) fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    pub(crate) fn max_readers(&self) -> usize {
        self.max_readers.load(Ordering::SeqCst)
    }
}

/// Increment `counter` in two separate steps so that unserialized callers
/// lose updates.
pub(crate) fn racy_increment(counter: &AtomicU64) {
    let value = counter.load(Ordering::Relaxed);
    for _ in 0..16 {
        core::hint::spin_loop();
    }
    counter.store(value + 1, Ordering::Relaxed);
}

/// Assert that `start.elapsed()` lies in `[min_ms, max_ms]`.
pub(crate) fn assert_elapsed_between(start: StdInstant, min_ms: u64, max_ms: u64) {
    let elapsed = start.elapsed();
    assert!(
        elapsed >= StdDuration::from_millis(min_ms),
        "returned after {:?}, expected at least {}ms",
        elapsed,
        min_ms
    );
    assert!(
        elapsed <= StdDuration::from_millis(max_ms),
        "returned after {:?}, expected at most {}ms",
        elapsed,
        max_ms
    );
}

/// Simple linear congruential generator for property testing.
pub(crate) struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub(crate) fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub(crate) fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state >> 11
    }

    pub(crate) fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        min + (self.next_u64() % (max - min))
    }

    pub(crate) fn gen_bool(&mut self) -> bool {
        self.next_u64() & 1 == 0
    }
}

#[cfg(test)]
mod helper_tests {
    use super::*;

    #[test]
    fn test_exclusion_probe_detects_overlap() {
        let probe = ExclusionProbe::new();
        probe.section(|| probe.section(|| ()));
        assert_eq!(probe.violations(), 1);
        assert_eq!(probe.entries(), 2);
    }

    #[test]
    fn test_rw_probe_allows_shared_readers() {
        let probe = RwProbe::new();
        probe.read(|| probe.read(|| ()));
        assert_eq!(probe.violations(), 0);
        assert_eq!(probe.max_readers(), 2);
        probe.read(|| probe.write(|| ()));
        assert_eq!(probe.violations(), 1);
    }

    #[test]
    fn test_rng_range() {
        let mut rng = SimpleRng::new(7);
        for _ in 0..1000 {
            let v = rng.gen_range(3, 9);
            assert!((3..9).contains(&v));
        }
    }
}
