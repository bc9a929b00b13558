use chrono::{NaiveDateTime, Utc};
use std::panic::RefUnwindSafe;

/// Source of "now" for every status decision. All timestamps are naive UTC,
/// matching what is stored in the database.
pub trait Clock: Send + Sync + RefUnwindSafe {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().naive_utc()
    }
}

/// Always returns the same instant. Used to pin the status calculator in tests.
#[cfg(test)]
#[derive(Clone, Copy, Debug)]
pub struct FixedClock(pub NaiveDateTime);

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

#[cfg(test)]
pub fn test_time() -> NaiveDateTime {
    NaiveDateTime::parse_from_str("2026-06-07 10:00:00", "%Y-%m-%d %H:%M:%S").unwrap()
}
