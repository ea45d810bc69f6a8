//! Monotonic-ish wall clock timestamps with nanosecond precision.
//!
//! Mirrors the original daemon's `fg_time.c`: a `Timestamp` is seconds and
//! nanoseconds since the epoch, always kept normalized (`0 <= nanos <
//! 1_000_000_000`). Two timestamps taken in program order are guaranteed to
//! compare in that order.

use std::time::{SystemTime, UNIX_EPOCH};

pub const NSEC_PER_SEC: i64 = 1_000_000_000;

/// A point in time, seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: i64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { secs: 0, nanos: 0 };

    pub fn new(secs: i64, nanos: i64) -> Timestamp {
        let mut tp = Timestamp { secs, nanos };
        tp.normalize();
        tp
    }

    /// Current wall-clock time.
    pub fn now() -> Timestamp {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            secs: d.as_secs() as i64,
            nanos: d.subsec_nanos() as i64,
        }
    }

    /// Carries nanoseconds into seconds so `0 <= nanos < NSEC_PER_SEC`.
    /// Returns true if the timestamp was already normalized.
    pub fn normalize(&mut self) -> bool {
        let mut normalized = true;
        while self.nanos >= NSEC_PER_SEC {
            self.nanos -= NSEC_PER_SEC;
            self.secs += 1;
            normalized = false;
        }
        while self.nanos < 0 {
            self.nanos += NSEC_PER_SEC;
            self.secs -= 1;
            normalized = false;
        }
        normalized
    }

    /// Returns a new timestamp `seconds` (possibly fractional) after `self`.
    pub fn add(self, seconds: f64) -> Timestamp {
        let whole = seconds.trunc() as i64;
        let frac = ((seconds - seconds.trunc()) * NSEC_PER_SEC as f64) as i64;
        Timestamp::new(self.secs + whole, self.nanos + frac)
    }

    /// `other - self` in seconds, negative if `other` is chronologically before `self`.
    pub fn diff(self, other: Timestamp) -> f64 {
        (other.secs - self.secs) as f64 + (other.nanos - self.nanos) as f64 / NSEC_PER_SEC as f64
    }

    /// True if `self` is chronologically after `other`.
    pub fn is_after(self, other: Timestamp) -> bool {
        match self.secs.cmp(&other.secs) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.nanos > other.nanos,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_normalizes() {
        let t = Timestamp::new(0, 0).add(1.5);
        assert_eq!(t.secs, 1);
        assert_eq!(t.nanos, 500_000_000);
    }

    #[test]
    fn diff_is_negative_when_reversed() {
        let a = Timestamp::new(10, 0);
        let b = Timestamp::new(5, 0);
        assert!(a.diff(b) < 0.0);
        assert!(b.diff(a) > 0.0);
    }

    #[test]
    fn is_after_orders_on_nanos() {
        let a = Timestamp::new(1, 500);
        let b = Timestamp::new(1, 100);
        assert!(a.is_after(b));
        assert!(!b.is_after(a));
    }

    #[test]
    fn normalize_carries_overflow_nanos() {
        let mut t = Timestamp { secs: 0, nanos: NSEC_PER_SEC + 1 };
        assert!(!t.normalize());
        assert_eq!(t.secs, 1);
        assert_eq!(t.nanos, 1);
    }
}
