use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

/// Source of "now" for the poller and resolver
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock in UTC
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Latest instant a backend can store: due times are kept as `i64`
/// nanoseconds since the epoch (around year 2262).
pub(crate) fn latest_storable() -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(i64::MAX)
}

/// Earliest instant a backend can store.
pub(crate) fn earliest_storable() -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(i64::MIN)
}

pub(crate) fn is_storable(time: DateTime<Utc>) -> bool {
    time.timestamp_nanos_opt().is_some()
}

/// `time + by`, saturating at the latest storable instant.
pub(crate) fn add_std(time: DateTime<Utc>, by: std::time::Duration) -> DateTime<Utc> {
    Duration::from_std(by)
        .ok()
        .and_then(|by| time.checked_add_signed(by))
        .map_or(latest_storable(), |t| t.min(latest_storable()))
}

/// `time - by`, saturating at the earliest storable instant.
pub(crate) fn sub_std(time: DateTime<Utc>, by: std::time::Duration) -> DateTime<Utc> {
    Duration::from_std(by)
        .ok()
        .and_then(|by| time.checked_sub_signed(by))
        .map_or(earliest_storable(), |t| t.max(earliest_storable()))
}
