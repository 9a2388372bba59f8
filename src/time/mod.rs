//! Time values and deadline arithmetic for timed waits.

use crate::errors::{SyncError, SyncResult};

/// Nanoseconds since some arbitrary epoch on the monotonic clock.
///
/// The kernel hands these out through [`Kernel::now`](crate::Kernel::now);
/// the epoch is implementation-defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Instant(u64);

impl Instant {
    /// Create a new instant from nanoseconds since epoch.
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Create a new instant from milliseconds since epoch.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Get nanoseconds since epoch.
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Get milliseconds since epoch.
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Duration since another instant, zero if `earlier` is later.
    pub const fn duration_since(self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl core::ops::Add<Duration> for Instant {
    type Output = Self;

    fn add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_nanos()))
    }
}

/// A duration of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(u64);

impl Duration {
    /// Create a duration from nanoseconds.
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Create a duration from microseconds.
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros.saturating_mul(1_000))
    }

    /// Create a duration from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Get nanoseconds in this duration.
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Get microseconds in this duration.
    pub const fn as_micros(self) -> u64 {
        self.0 / 1_000
    }

    /// Get milliseconds in this duration, truncated.
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }
}

/// Clock domain an absolute timeout is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClockId {
    /// Wall-clock time
    #[default]
    Realtime,
    /// Time since boot, never adjusted
    Monotonic,
}

/// Seconds and nanoseconds, as used for absolute deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    pub const NANOS_PER_SEC: i64 = 1_000_000_000;

    pub const fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    /// Reject a nanosecond field outside `[0, 1e9)`.
    pub const fn validate(&self) -> SyncResult<()> {
        if self.nsec < 0 || self.nsec >= Self::NANOS_PER_SEC {
            return Err(SyncError::InvalidArgument);
        }
        Ok(())
    }

    /// Milliseconds from `now` until `self`, truncated toward zero.
    ///
    /// Zero or negative means the deadline has already passed.
    /// Saturates at the `i64` range for deadlines centuries away.
    pub const fn millis_since(&self, now: &Timespec) -> i64 {
        let millis = (self.sec as i128 - now.sec as i128) * 1000
            + (self.nsec as i128 - now.nsec as i128) / 1_000_000;
        if millis > i64::MAX as i128 {
            i64::MAX
        } else if millis < i64::MIN as i128 {
            i64::MIN
        } else {
            millis as i64
        }
    }

    /// This time shifted forward by `millis` milliseconds, saturating at the
    /// ends of the seconds range.
    pub const fn add_millis(&self, millis: i64) -> Self {
        let nsec = self.nsec + (millis % 1000) * 1_000_000;
        let sec = self
            .sec
            .saturating_add(millis / 1000)
            .saturating_add(nsec.div_euclid(Self::NANOS_PER_SEC));
        Self {
            sec,
            nsec: nsec.rem_euclid(Self::NANOS_PER_SEC),
        }
    }
}

/// Convert an absolute deadline into a relative millisecond timeout.
///
/// Fails with `TimedOut` when the deadline is not in the future, so an
/// expired deadline never reaches a blocking call.
pub fn relative_timeout(abstime: &Timespec, now: &Timespec) -> SyncResult<u32> {
    abstime.validate()?;
    let millis = abstime.millis_since(now);
    if millis <= 0 {
        return Err(SyncError::TimedOut);
    }
    Ok(u32::try_from(millis).unwrap_or(u32::MAX))
}

/// Absolute end of a millisecond timeout; a timeout of `0` never expires.
///
/// Timed operations recompute what is left on every retry so spurious
/// wakeups do not extend the effective deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline that never expires.
    pub const FOREVER: Self = Self(None);

    /// Deadline `timeout_ms` milliseconds after `now`.
    pub fn after(now: Instant, timeout_ms: u32) -> Self {
        if timeout_ms == 0 {
            Self::FOREVER
        } else {
            Self(Some(now + Duration::from_millis(u64::from(timeout_ms))))
        }
    }

    /// Whether this deadline can expire.
    pub const fn is_bounded(&self) -> bool {
        self.0.is_some()
    }

    /// Milliseconds left before the deadline, `0` for an unbounded one.
    ///
    /// Fails with `TimedOut` once less than a whole millisecond remains.
    pub fn remaining(&self, now: Instant) -> SyncResult<u32> {
        let Some(end) = self.0 else {
            return Ok(0);
        };
        match end.duration_since(now).as_millis() {
            0 => Err(SyncError::TimedOut),
            ms => Ok(u32::try_from(ms).unwrap_or(u32::MAX)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_truncate_toward_zero() {
        let now = Timespec::new(10, 900_000_000);
        assert_eq!(Timespec::new(11, 0).millis_since(&now), 100);
        assert_eq!(Timespec::new(10, 900_999_999).millis_since(&now), 0);
        assert_eq!(Timespec::new(10, 899_500_000).millis_since(&now), 0);
        assert_eq!(Timespec::new(9, 0).millis_since(&now), -1900);
    }

    #[test]
    fn relative_timeout_rejects_past_and_bad_nsec() {
        let now = Timespec::new(100, 0);
        assert_eq!(relative_timeout(&Timespec::new(99, 0), &now), Err(SyncError::TimedOut));
        assert_eq!(relative_timeout(&Timespec::new(100, 0), &now), Err(SyncError::TimedOut));
        assert_eq!(relative_timeout(&Timespec::new(101, -1), &now), Err(SyncError::InvalidArgument));
        assert_eq!(
            relative_timeout(&Timespec::new(101, 1_000_000_000), &now),
            Err(SyncError::InvalidArgument)
        );
        assert_eq!(relative_timeout(&Timespec::new(101, 500_000_000), &now), Ok(1500));
    }

    #[test]
    fn add_millis_carries() {
        let t = Timespec::new(1, 999_000_000).add_millis(2);
        assert_eq!(t, Timespec::new(2, 1_000_000));
        let back = Timespec::new(2, 0).add_millis(-1);
        assert_eq!(back, Timespec::new(1, 999_000_000));
    }

    #[test]
    fn far_deadlines_saturate() {
        let now = Timespec::new(1_000, 500_000_000);
        assert_eq!(Timespec::new(i64::MAX, 0).millis_since(&now), i64::MAX);
        assert_eq!(Timespec::new(i64::MIN, 0).millis_since(&now), i64::MIN);
        assert_eq!(relative_timeout(&Timespec::new(i64::MAX, 999_999_999), &now), Ok(u32::MAX));
        assert_eq!(relative_timeout(&Timespec::new(i64::MIN, 0), &now), Err(SyncError::TimedOut));
        // Seconds far in the past measured against a late `now`.
        assert_eq!(Timespec::new(0, 0).millis_since(&Timespec::new(i64::MAX, 0)), i64::MIN);
    }

    #[test]
    fn add_millis_saturates() {
        assert_eq!(Timespec::new(i64::MAX, 0).add_millis(i64::MAX).sec, i64::MAX);
        assert_eq!(Timespec::new(i64::MIN, 0).add_millis(i64::MIN).sec, i64::MIN);
        let t = Timespec::new(i64::MAX - 1, 999_000_000).add_millis(1_000);
        assert_eq!(t, Timespec::new(i64::MAX, 999_000_000));
    }

    #[test]
    fn deadline_remaining() {
        let start = Instant::from_millis(1_000);
        let deadline = Deadline::after(start, 50);
        assert_eq!(deadline.remaining(start), Ok(50));
        assert_eq!(deadline.remaining(Instant::from_millis(1_030)), Ok(20));
        assert_eq!(
            deadline.remaining(Instant::from_nanos(1_049_500_000)),
            Err(SyncError::TimedOut)
        );
        assert_eq!(deadline.remaining(Instant::from_millis(2_000)), Err(SyncError::TimedOut));
    }

    #[test]
    fn zero_timeout_is_forever() {
        let deadline = Deadline::after(Instant::from_millis(5), 0);
        assert!(!deadline.is_bounded());
        assert_eq!(deadline.remaining(Instant::from_millis(u64::MAX / 2_000_000)), Ok(0));
    }
}
