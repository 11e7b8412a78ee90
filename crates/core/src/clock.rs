//! Time source abstraction.
//!
//! Everything that compares timestamps (circuit recovery, trailing windows,
//! delayed tasks) reads time through [`Clock`] so tests can drive it by hand.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync + core::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// `at + by`, or `None` when the result is not representable.
pub fn checked_offset(at: DateTime<Utc>, by: std::time::Duration) -> Option<DateTime<Utc>> {
    Duration::from_std(by)
        .ok()
        .and_then(|by| at.checked_add_signed(by))
}

/// `at + by`, clamped to the latest representable instant.
pub fn saturating_offset(at: DateTime<Utc>, by: std::time::Duration) -> DateTime<Utc> {
    checked_offset(at, by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Wall-clock time.
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
