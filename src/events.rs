use crate::auth::{find_church, Actor};
use crate::clock::Clock;
use crate::db::last_insert_id;
use crate::error::{Error, Result};
use crate::models::{Event, NewEvent};
use crate::notify::{compose, NotificationKind, Notifier};
use crate::schema::events;
use crate::status::EventStatus;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info};

pub const MIN_CANCELLATION_REASON_CHARS: usize = 10;

#[derive(Debug, Serialize)]
pub struct EventView {
    pub id: i32,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub link: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub organizer_id: i32,
    pub church_id: Option<i32>,
    pub status: EventStatus,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<i32>,
    pub interested_count: i32,
}

impl EventView {
    pub fn new(event: Event, now: NaiveDateTime) -> EventView {
        EventView {
            status: EventStatus::of(&event, now),
            id: event.id,
            title: event.title,
            description: event.description,
            location: event.location,
            link: event.link,
            start_time: Utc.from_utc_datetime(&event.start_time),
            end_time: Utc.from_utc_datetime(&event.end_time),
            organizer_id: event.organizer_id,
            church_id: event.church_id,
            cancelled_at: event.cancelled_at.map(|at| Utc.from_utc_datetime(&at)),
            cancellation_reason: event.cancellation_reason,
            cancelled_by: event.cancelled_by,
            interested_count: event.interested_count,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct NewEventRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub link: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Partial update of an event. Absent fields are left alone. For the
/// optional text fields an empty string clears the stored value.
#[derive(Debug, Default, Deserialize)]
pub struct EventUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub link: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl EventUpdate {
    fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.location.is_none()
            && self.link.is_none()
            && self.start_time.is_none()
            && self.end_time.is_none()
    }
}

#[derive(AsChangeset)]
#[table_name = "events"]
struct EventChanges<'a> {
    title: Option<&'a str>,
    description: Option<Option<&'a str>>,
    location: Option<Option<&'a str>>,
    link: Option<Option<&'a str>>,
    start_time: Option<NaiveDateTime>,
    end_time: Option<NaiveDateTime>,
    updated_at: NaiveDateTime,
}

#[derive(Debug, Default)]
pub struct EventFilter {
    pub church_id: Option<i32>,
    pub status: Option<EventStatus>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mutation {
    Edit,
    Cancel,
    Reactivate,
    Delete,
    Announce,
}

impl Mutation {
    fn verb(self) -> &'static str {
        match self {
            Mutation::Edit => "edit",
            Mutation::Cancel => "cancel",
            Mutation::Reactivate => "reactivate",
            Mutation::Delete => "delete",
            Mutation::Announce => "send notifications for",
        }
    }
}

/// Who may request `mutation`: admins always, organizers for their own
/// events, and only admins may delete.
pub fn authorize(actor: &Actor, event: &Event, mutation: Mutation) -> Result<()> {
    if mutation == Mutation::Delete {
        if actor.is_admin() {
            return Ok(());
        }
        return Err(Error::Forbidden(
            "only an administrator may delete events".to_owned(),
        ));
    }
    if actor.is_admin() || event.organizer_id == actor.id {
        Ok(())
    } else {
        Err(Error::Forbidden(format!(
            "only the organizer may {} this event",
            mutation.verb()
        )))
    }
}

/// Whether the event's status at `now` allows `mutation`. This is the only
/// place status-dependent rules live.
pub fn check_transition(event: &Event, mutation: Mutation, now: NaiveDateTime) -> Result<()> {
    use EventStatus::*;

    let status = EventStatus::of(event, now);
    match (mutation, status) {
        (Mutation::Delete, _) => Ok(()),

        (Mutation::Edit, Upcoming) | (Mutation::Edit, Ongoing) => Ok(()),
        (Mutation::Edit, Completed) => Err(Error::InvalidState(
            "The event has ended and can no longer be edited".to_owned(),
        )),
        (Mutation::Edit, Cancelled) => Err(Error::InvalidState(
            "The event is cancelled; reactivate it before editing".to_owned(),
        )),

        (Mutation::Cancel, Upcoming) => Ok(()),
        (Mutation::Cancel, Cancelled) => Err(Error::AlreadyCancelled),
        (Mutation::Cancel, Ongoing) => Err(Error::InvalidState(
            "Cannot cancel an ongoing event".to_owned(),
        )),
        (Mutation::Cancel, Completed) => Err(Error::AlreadyCompleted),

        (Mutation::Reactivate, Cancelled) => {
            match EventStatus::temporal(event.start_time, event.end_time, now) {
                Completed => Err(Error::AlreadyCompleted),
                _ => Ok(()),
            }
        }
        (Mutation::Reactivate, _) => Err(Error::NotCancelled),

        (Mutation::Announce, Upcoming) | (Mutation::Announce, Ongoing) => Ok(()),
        (Mutation::Announce, Cancelled) => Err(Error::InvalidState(
            "The event is cancelled; reactivate it before sending notifications".to_owned(),
        )),
        (Mutation::Announce, Completed) => Err(Error::AlreadyCompleted),
    }
}

pub fn validate_cancellation_reason(reason: Option<&str>) -> Result<&str> {
    let reason = reason.map(str::trim).unwrap_or("");
    if reason.chars().count() < MIN_CANCELLATION_REASON_CHARS {
        return Err(Error::Validation(format!(
            "a cancellation reason of at least {} characters is required",
            MIN_CANCELLATION_REASON_CHARS
        )));
    }
    Ok(reason)
}

fn validate_window(start: NaiveDateTime, end: NaiveDateTime) -> Result<()> {
    if end <= start {
        return Err(Error::Validation(
            "end_time must be after start_time".to_owned(),
        ));
    }
    Ok(())
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value
        .as_ref()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn clearable(value: &Option<String>) -> Option<Option<&str>> {
    value.as_ref().map(|value| {
        let value = value.trim();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    })
}

pub fn find_event(conn: &SqliteConnection, id: i32) -> Result<Event> {
    events::table
        .find(id)
        .first::<Event>(conn)
        .optional()?
        .ok_or(Error::EventNotFound(id))
}

fn church_name(conn: &SqliteConnection, church_id: Option<i32>) -> Result<Option<String>> {
    match church_id {
        Some(id) => match find_church(conn, id) {
            Ok(church) => Ok(Some(church.name)),
            Err(Error::ChurchNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        },
        None => Ok(None),
    }
}

/// Event reads and the guarded mutations. Every mutation runs in an
/// immediate transaction: the event is re-read, ownership and status are
/// checked and the write happens while the database write lock is held, so
/// concurrent requests see each other's effects.
pub struct Events<'a> {
    conn: &'a SqliteConnection,
    clock: &'a dyn Clock,
    notifier: &'a Notifier,
}

impl<'a> Events<'a> {
    pub fn new(conn: &'a SqliteConnection, clock: &'a dyn Clock, notifier: &'a Notifier) -> Self {
        Events {
            conn,
            clock,
            notifier,
        }
    }

    fn view(&self, event: Event) -> EventView {
        EventView::new(event, self.clock.now())
    }

    pub fn get(&self, id: i32) -> Result<EventView> {
        find_event(self.conn, id).map(|event| self.view(event))
    }

    pub fn list(&self, filter: &EventFilter) -> Result<Vec<EventView>> {
        let mut query = events::table
            .order((events::start_time.asc(), events::id.asc()))
            .into_boxed();
        if let Some(church) = filter.church_id {
            query = query.filter(events::church_id.eq(church));
        }
        let found = query.load::<Event>(self.conn)?;
        Ok(self.views_with_status(found, filter.status))
    }

    pub fn list_mine(&self, actor: &Actor, wanted: Option<EventStatus>) -> Result<Vec<EventView>> {
        let mut query = events::table
            .order((events::start_time.asc(), events::id.asc()))
            .into_boxed();
        if !actor.is_admin() {
            query = query.filter(events::organizer_id.eq(actor.id));
        }
        let found = query.load::<Event>(self.conn)?;
        Ok(self.views_with_status(found, wanted))
    }

    fn views_with_status(&self, found: Vec<Event>, wanted: Option<EventStatus>) -> Vec<EventView> {
        let now = self.clock.now();
        found
            .into_iter()
            .map(|event| EventView::new(event, now))
            .filter(|view| wanted.map(|wanted| view.status == wanted).unwrap_or(true))
            .collect()
    }

    pub fn create(&self, actor: &Actor, request: NewEventRequest) -> Result<EventView> {
        let mut missing = Vec::new();
        let title = non_blank(&request.title);
        if title.is_none() {
            missing.push("title".to_owned());
        }
        if request.start_time.is_none() {
            missing.push("start_time".to_owned());
        }
        if request.end_time.is_none() {
            missing.push("end_time".to_owned());
        }
        let (title, start, end) = match (title, request.start_time, request.end_time) {
            (Some(title), Some(start), Some(end)) => (title, start.naive_utc(), end.naive_utc()),
            _ => return Err(Error::MissingFieldError(missing)),
        };
        validate_window(start, end)?;

        let now = self.clock.now();
        let new_event = NewEvent {
            title,
            description: non_blank(&request.description),
            location: non_blank(&request.location),
            link: non_blank(&request.link),
            start_time: start,
            end_time: end,
            organizer_id: actor.id,
            church_id: actor.church_id,
            interested_count: 0,
            created_at: now,
            updated_at: now,
        };
        let event = self.conn.immediate_transaction::<_, Error, _>(|| {
            diesel::insert_into(events::table)
                .values(&new_event)
                .execute(self.conn)?;
            find_event(self.conn, last_insert_id(self.conn)?)
        })?;
        info!(event_id = event.id, actor_id = actor.id, "event created");
        Ok(self.view(event))
    }

    fn guarded<T, F>(&self, actor: &Actor, id: i32, mutation: Mutation, mutate: F) -> Result<T>
    where
        F: FnOnce(&Event, NaiveDateTime) -> Result<T>,
    {
        let outcome = self.conn.immediate_transaction::<_, Error, _>(|| {
            let event = find_event(self.conn, id)?;
            authorize(actor, &event, mutation)?;
            let now = self.clock.now();
            check_transition(&event, mutation, now)?;
            mutate(&event, now)
        });
        if let Err(err) = &outcome {
            if !err.is_internal() {
                debug!(event_id = id, actor_id = actor.id, mutation = mutation.verb(), error = %err, "mutation rejected");
            }
        }
        outcome
    }

    pub fn edit(&self, actor: &Actor, id: i32, update: EventUpdate) -> Result<EventView> {
        if update.is_empty() {
            return Err(Error::Validation("no fields to update".to_owned()));
        }
        if update.title.is_some() && non_blank(&update.title).is_none() {
            return Err(Error::Validation("title must not be blank".to_owned()));
        }

        let (event, church) = self.guarded(actor, id, Mutation::Edit, |current, now| {
            let start = update
                .start_time
                .map(|at| at.naive_utc())
                .unwrap_or(current.start_time);
            let end = update
                .end_time
                .map(|at| at.naive_utc())
                .unwrap_or(current.end_time);
            validate_window(start, end)?;

            let changes = EventChanges {
                title: non_blank(&update.title),
                description: clearable(&update.description),
                location: clearable(&update.location),
                link: clearable(&update.link),
                start_time: update.start_time.map(|at| at.naive_utc()),
                end_time: update.end_time.map(|at| at.naive_utc()),
                updated_at: now,
            };
            diesel::update(events::table.find(current.id))
                .set(&changes)
                .execute(self.conn)?;
            Ok((find_event(self.conn, current.id)?, church_name(self.conn, current.church_id)?))
        })?;

        info!(event_id = id, actor_id = actor.id, "event edited");
        self.notifier.notify(compose(
            NotificationKind::Modified,
            &event,
            church.as_ref().map(String::as_str),
            None,
        ));
        Ok(self.view(event))
    }

    pub fn cancel(&self, actor: &Actor, id: i32, reason: Option<&str>) -> Result<EventView> {
        let reason = validate_cancellation_reason(reason)?;

        let (event, church) = self.guarded(actor, id, Mutation::Cancel, |current, now| {
            diesel::update(events::table.find(current.id))
                .set((
                    events::cancelled_at.eq(Some(now)),
                    events::cancellation_reason.eq(Some(reason)),
                    events::cancelled_by.eq(Some(actor.id)),
                    events::updated_at.eq(now),
                ))
                .execute(self.conn)?;
            Ok((find_event(self.conn, current.id)?, church_name(self.conn, current.church_id)?))
        })?;

        info!(event_id = id, actor_id = actor.id, "event cancelled");
        self.notifier.notify(compose(
            NotificationKind::Cancelled,
            &event,
            church.as_ref().map(String::as_str),
            Some(reason),
        ));
        Ok(self.view(event))
    }

    pub fn reactivate(&self, actor: &Actor, id: i32) -> Result<EventView> {
        let event = self.guarded(actor, id, Mutation::Reactivate, |current, now| {
            diesel::update(events::table.find(current.id))
                .set((
                    events::cancelled_at.eq(None::<NaiveDateTime>),
                    events::cancellation_reason.eq(None::<String>),
                    events::cancelled_by.eq(None::<i32>),
                    events::updated_at.eq(now),
                ))
                .execute(self.conn)?;
            find_event(self.conn, current.id)
        })?;

        info!(event_id = id, actor_id = actor.id, "event reactivated");
        Ok(self.view(event))
    }

    pub fn delete(&self, actor: &Actor, id: i32) -> Result<()> {
        self.guarded(actor, id, Mutation::Delete, |current, _| {
            use crate::schema::interests::dsl::{event_id, interests};

            diesel::delete(interests.filter(event_id.eq(current.id))).execute(self.conn)?;
            diesel::delete(events::table.find(current.id)).execute(self.conn)?;
            Ok(())
        })?;
        info!(event_id = id, actor_id = actor.id, "event deleted");
        Ok(())
    }

    pub fn announce(
        &self,
        actor: &Actor,
        id: i32,
        kind: Option<NotificationKind>,
        message: Option<&str>,
    ) -> Result<()> {
        let kind = match kind {
            Some(NotificationKind::Reminder) => NotificationKind::Reminder,
            Some(NotificationKind::NewInfo) => NotificationKind::NewInfo,
            Some(other) => {
                return Err(Error::Validation(format!(
                    "{} notifications are sent automatically",
                    other.as_str()
                )))
            }
            None => return Err(Error::MissingFieldError(vec!["kind".to_owned()])),
        };
        let message = message
            .map(str::trim)
            .filter(|message| !message.is_empty())
            .ok_or_else(|| Error::MissingFieldError(vec!["message".to_owned()]))?;

        let (event, church) = self.guarded(actor, id, Mutation::Announce, |current, _| {
            Ok((current.clone(), church_name(self.conn, current.church_id)?))
        })?;

        info!(event_id = id, actor_id = actor.id, kind = kind.as_str(), "announcement queued");
        self.notifier.notify(compose(
            kind,
            &event,
            church.as_ref().map(String::as_str),
            Some(message),
        ));
        Ok(())
    }
}
