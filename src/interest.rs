use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::events::find_event;
use crate::schema::{events, interests};

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde_derive::Serialize;
use tracing::debug;

#[derive(Debug, Eq, PartialEq, Serialize)]
pub struct InterestCount {
    pub event_id: i32,
    pub interested_count: i32,
}

#[derive(Debug, Eq, PartialEq, Serialize)]
pub struct LeaveOutcome {
    pub event_id: i32,
    pub interested_count: i32,
    pub removed: bool,
}

fn device_id_required(device_id: &str) -> Result<&str> {
    let device_id = device_id.trim();
    if device_id.is_empty() {
        return Err(Error::MissingFieldError(vec!["device_id".to_owned()]));
    }
    Ok(device_id)
}

/// Recounts the interest rows of `event` and stores the result on the event.
/// The stored counter is always overwritten from the relation, never bumped.
fn refresh_count(conn: &SqliteConnection, event: i32) -> Result<i32> {
    let live = interests::table
        .filter(interests::event_id.eq(event))
        .count()
        .get_result::<i64>(conn)? as i32;
    diesel::update(events::table.find(event))
        .set(events::interested_count.eq(live))
        .execute(conn)?;
    Ok(live)
}

/// Marks `device_id` as interested in `event`. Joining again is a no-op.
/// Cancelled events accept no new interest.
pub fn join(
    conn: &SqliteConnection,
    clock: &dyn Clock,
    event: i32,
    device_id: &str,
) -> Result<InterestCount> {
    let device_id = device_id_required(device_id)?;
    let interested_count = conn.immediate_transaction::<_, Error, _>(|| {
        let found = find_event(conn, event)?;
        if found.cancelled_at.is_some() {
            return Err(Error::EventCancelled);
        }
        diesel::insert_or_ignore_into(interests::table)
            .values((
                interests::event_id.eq(event),
                interests::device_id.eq(device_id),
                interests::created_at.eq(clock.now()),
            ))
            .execute(conn)?;
        refresh_count(conn, event)
    })?;
    debug!(event_id = event, device_id, interested_count, "interest joined");
    Ok(InterestCount {
        event_id: event,
        interested_count,
    })
}

pub fn leave(conn: &SqliteConnection, event: i32, device_id: &str) -> Result<LeaveOutcome> {
    let device_id = device_id_required(device_id)?;
    let (removed, interested_count) = conn.immediate_transaction::<_, Error, _>(|| {
        find_event(conn, event)?;
        let removed = diesel::delete(
            interests::table
                .filter(interests::event_id.eq(event))
                .filter(interests::device_id.eq(device_id)),
        )
        .execute(conn)?;
        Ok((removed > 0, refresh_count(conn, event)?))
    })?;
    debug!(event_id = event, device_id, removed, interested_count, "interest left");
    Ok(LeaveOutcome {
        event_id: event,
        interested_count,
        removed,
    })
}

pub fn is_interested(conn: &SqliteConnection, event: i32, device_id: &str) -> Result<bool> {
    let device_id = device_id_required(device_id)?;
    let rows = interests::table
        .filter(interests::event_id.eq(event))
        .filter(interests::device_id.eq(device_id))
        .count()
        .get_result::<i64>(conn)?;
    Ok(rows > 0)
}

pub fn count(conn: &SqliteConnection, event: i32) -> Result<InterestCount> {
    let found = find_event(conn, event)?;
    Ok(InterestCount {
        event_id: found.id,
        interested_count: found.interested_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::fixtures;
    use crate::clock::{test_time, FixedClock};
    use crate::db::test_connection;
    use crate::events::{Events, NewEventRequest};
    use crate::models::{Event, Interest};
    use crate::notify::Notifier;
    use chrono::{Duration, TimeZone, Utc};

    fn seed_event(conn: &SqliteConnection) -> i32 {
        let pastor = fixtures::pastor(conn, "St Mary's");
        let clock = FixedClock(test_time());
        let (notifier, _) = Notifier::channel();
        Events::new(conn, &clock, &notifier)
            .create(
                &pastor,
                NewEventRequest {
                    title: Some("Choir".to_owned()),
                    start_time: Some(Utc.from_utc_datetime(&(test_time() + Duration::hours(1)))),
                    end_time: Some(Utc.from_utc_datetime(&(test_time() + Duration::hours(2)))),
                    ..NewEventRequest::default()
                },
            )
            .unwrap()
            .id
    }

    fn live_rows(conn: &SqliteConnection, id: i32) -> usize {
        let event = find_event(conn, id).unwrap();
        Interest::belonging_to(&event)
            .load::<Interest>(conn)
            .unwrap()
            .len()
    }

    fn stored_count(conn: &SqliteConnection, id: i32) -> i32 {
        let event: Event = find_event(conn, id).unwrap();
        event.interested_count
    }

    #[test]
    fn join_and_leave_are_idempotent() {
        let conn = test_connection();
        let clock = FixedClock(test_time());
        let event = seed_event(&conn);

        assert_eq!(join(&conn, &clock, event, "d1").unwrap().interested_count, 1);
        assert_eq!(join(&conn, &clock, event, "d1").unwrap().interested_count, 1);
        assert!(is_interested(&conn, event, "d1").unwrap());

        let first = leave(&conn, event, "d1").unwrap();
        assert_eq!((first.interested_count, first.removed), (0, true));
        let second = leave(&conn, event, "d1").unwrap();
        assert_eq!((second.interested_count, second.removed), (0, false));
        assert!(!is_interested(&conn, event, "d1").unwrap());
    }

    #[test]
    fn counter_matches_rows_after_any_sequence() {
        let conn = test_connection();
        let clock = FixedClock(test_time());
        let event = seed_event(&conn);
        let steps: &[(bool, &str)] = &[
            (true, "a"),
            (true, "b"),
            (true, "a"),
            (false, "c"),
            (true, "c"),
            (false, "a"),
            (true, "d"),
            (false, "b"),
            (false, "b"),
        ];
        for (joining, device) in steps {
            if *joining {
                join(&conn, &clock, event, device).unwrap();
            } else {
                leave(&conn, event, device).unwrap();
            }
            assert_eq!(stored_count(&conn, event) as usize, live_rows(&conn, event));
        }
        assert_eq!(count(&conn, event).unwrap().interested_count, 2);
    }

    #[test]
    fn counter_heals_from_a_stale_value() {
        let conn = test_connection();
        let clock = FixedClock(test_time());
        let event = seed_event(&conn);
        diesel::update(events::table.find(event))
            .set(events::interested_count.eq(17))
            .execute(&conn)
            .unwrap();

        assert_eq!(join(&conn, &clock, event, "d1").unwrap().interested_count, 1);
    }

    #[test]
    fn cancelled_events_refuse_new_interest_but_allow_leaving() {
        let conn = test_connection();
        let clock = FixedClock(test_time());
        let event = seed_event(&conn);
        join(&conn, &clock, event, "d1").unwrap();

        let pastor_id = find_event(&conn, event).unwrap().organizer_id;
        diesel::update(events::table.find(event))
            .set((
                events::cancelled_at.eq(Some(test_time())),
                events::cancellation_reason.eq(Some("Snowed in, sorry all")),
                events::cancelled_by.eq(Some(pastor_id)),
            ))
            .execute(&conn)
            .unwrap();

        match join(&conn, &clock, event, "d2") {
            Err(Error::EventCancelled) => {}
            other => panic!("expected EventCancelled, got {:?}", other),
        }
        assert_eq!(stored_count(&conn, event), 1);
        let left = leave(&conn, event, "d1").unwrap();
        assert!(left.removed);
        assert_eq!(left.interested_count, 0);
    }

    #[test]
    fn unknown_event_and_blank_device_are_rejected() {
        let conn = test_connection();
        let clock = FixedClock(test_time());
        match join(&conn, &clock, 42, "d1") {
            Err(Error::EventNotFound(42)) => {}
            other => panic!("expected EventNotFound, got {:?}", other),
        }
        match leave(&conn, 42, "d1") {
            Err(Error::EventNotFound(42)) => {}
            other => panic!("expected EventNotFound, got {:?}", other),
        }
        let event = seed_event(&conn);
        match join(&conn, &clock, event, "  ") {
            Err(Error::MissingFieldError(_)) => {}
            other => panic!("expected MissingFieldError, got {:?}", other),
        }
    }
}
