// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Clock sampling and shared-memory timestamps.
//!
//! Send times live in the message header as 64-bit nanosecond counts with
//! `i64::MIN` reserved for "not populated yet". They are filled in *after*
//! the slot compare-exchange via a CAS-from-invalid, so the first party to
//! look at a freshly published message (the sender, or a reader that got
//! there first) stamps it. Whoever loses the race adopts the winner's value.
//! This is what keeps send times monotonically non-decreasing across multiple
//! senders without any sender-to-sender lock.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Nanosecond value meaning "timestamp not populated".
pub(crate) const INVALID_NANOS: i64 = i64::MIN;

/// A point on `CLOCK_MONOTONIC`, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MonotonicTime(i64);

/// A point on `CLOCK_REALTIME`, in nanoseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RealtimeTime(i64);

fn clock_nanos(clock: libc::clockid_t) -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid, writable timespec and the clock id is a
    // compile-time constant the kernel supports. clock_gettime only writes
    // through the pointer it is given.
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    debug_assert_eq!(rc, 0);
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}

impl MonotonicTime {
    pub const INVALID: Self = Self(INVALID_NANOS);

    #[must_use]
    pub fn now() -> Self {
        Self(clock_nanos(libc::CLOCK_MONOTONIC))
    }

    #[must_use]
    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[must_use]
    pub fn nanos(&self) -> i64 {
        self.0
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        self.0 != INVALID_NANOS
    }

    /// Distance to a *strictly* earlier time; `None` when either side is
    /// unpopulated or `earlier` is not strictly earlier (equal counts as not
    /// earlier). The rate check in the send path leans on the strictness: a
    /// message stamped at exactly our clock sample was stamped by somebody
    /// who beat us, not by a publication a full window ago.
    #[must_use]
    pub fn duration_since(&self, earlier: Self) -> Option<Duration> {
        if !self.valid() || !earlier.valid() || self.0 <= earlier.0 {
            return None;
        }
        Some(Duration::from_nanos((self.0 - earlier.0) as u64))
    }
}

impl RealtimeTime {
    pub const INVALID: Self = Self(INVALID_NANOS);

    #[must_use]
    pub fn now() -> Self {
        Self(clock_nanos(libc::CLOCK_REALTIME))
    }

    #[must_use]
    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[must_use]
    pub fn nanos(&self) -> i64 {
        self.0
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        self.0 != INVALID_NANOS
    }
}

impl fmt::Display for MonotonicTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid() {
            write!(f, "{}.{:09}sec", self.0 / 1_000_000_000, self.0 % 1_000_000_000)
        } else {
            write!(f, "(invalid)")
        }
    }
}

impl fmt::Display for RealtimeTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid() {
            write!(f, "{}.{:09}sec", self.0 / 1_000_000_000, self.0 % 1_000_000_000)
        } else {
            write!(f, "(invalid)")
        }
    }
}

/// A nanosecond timestamp in shared memory with CAS-from-invalid population.
#[repr(transparent)]
pub struct AtomicTimestamp(AtomicI64);

impl AtomicTimestamp {
    pub fn load(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn relaxed_load(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Plain store, only legal while the containing message is privately
    /// owned (a sender's scratch before publish, or initialization).
    pub fn store(&self, nanos: i64) {
        self.0.store(nanos, Ordering::Release);
    }

    pub fn invalidate(&self) {
        self.0.store(INVALID_NANOS, Ordering::Release);
    }

    /// Try to move this timestamp from "unpopulated" to `nanos`. Returns the
    /// value that ends up stored: `nanos` if we won, the winner's value if
    /// someone beat us to it.
    pub fn populate(&self, nanos: i64) -> i64 {
        match self
            .0
            .compare_exchange(INVALID_NANOS, nanos, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => nanos,
            Err(existing) => existing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_now_advances() {
        let a = MonotonicTime::now();
        let b = MonotonicTime::now();
        assert!(a.valid());
        assert!(b >= a);
    }

    #[test]
    fn test_duration_since() {
        let a = MonotonicTime::from_nanos(1_000);
        let b = MonotonicTime::from_nanos(3_500);
        assert_eq!(b.duration_since(a), Some(Duration::from_nanos(2_500)));
        assert_eq!(a.duration_since(b), None);
        assert_eq!(MonotonicTime::INVALID.duration_since(a), None);
        assert_eq!(b.duration_since(MonotonicTime::INVALID), None);
    }

    #[test]
    fn test_duration_since_equal_is_not_earlier() {
        // Strict: an identical timestamp yields None, not a zero duration.
        // The send path's rate check depends on this boundary.
        let t = MonotonicTime::from_nanos(42);
        assert_eq!(t.duration_since(t), None);
        assert_eq!(
            MonotonicTime::INVALID.duration_since(MonotonicTime::INVALID),
            None
        );
    }

    #[test]
    fn test_populate_first_writer_wins() {
        let ts = AtomicTimestamp(AtomicI64::new(INVALID_NANOS));
        assert_eq!(ts.load(), INVALID_NANOS);

        assert_eq!(ts.populate(42), 42);
        // A later populate adopts the stored value instead of overwriting.
        assert_eq!(ts.populate(99), 42);
        assert_eq!(ts.load(), 42);

        ts.invalidate();
        assert_eq!(ts.populate(99), 99);
    }
}
