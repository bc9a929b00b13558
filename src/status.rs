use crate::error::Error;
use crate::models::Event;

use chrono::NaiveDateTime;
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Display status of an event. Never stored: it depends on "now", so it is
/// recomputed each time an event is read or checked.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Upcoming,
    Ongoing,
    Completed,
    Cancelled,
}

impl EventStatus {
    /// Cancellation wins over the time window. Both window ends are inclusive.
    pub fn compute(
        start_time: NaiveDateTime,
        end_time: NaiveDateTime,
        cancelled_at: Option<NaiveDateTime>,
        now: NaiveDateTime,
    ) -> EventStatus {
        if cancelled_at.is_some() {
            EventStatus::Cancelled
        } else {
            EventStatus::temporal(start_time, end_time, now)
        }
    }

    /// Where `now` falls relative to the time window alone.
    pub fn temporal(
        start_time: NaiveDateTime,
        end_time: NaiveDateTime,
        now: NaiveDateTime,
    ) -> EventStatus {
        if now < start_time {
            EventStatus::Upcoming
        } else if now <= end_time {
            EventStatus::Ongoing
        } else {
            EventStatus::Completed
        }
    }

    pub fn of(event: &Event, now: NaiveDateTime) -> EventStatus {
        EventStatus::compute(event.start_time, event.end_time, event.cancelled_at, now)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Upcoming => "UPCOMING",
            EventStatus::Ongoing => "ONGOING",
            EventStatus::Completed => "COMPLETED",
            EventStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<EventStatus, Error> {
        match s.to_ascii_uppercase().as_str() {
            "UPCOMING" => Ok(EventStatus::Upcoming),
            "ONGOING" => Ok(EventStatus::Ongoing),
            "COMPLETED" => Ok(EventStatus::Completed),
            "CANCELLED" => Ok(EventStatus::Cancelled),
            _ => Err(Error::Validation(format!("unknown event status: {}", s))),
        }
    }
}
