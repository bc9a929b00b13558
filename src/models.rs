use crate::schema::*;

use chrono::NaiveDateTime;

#[derive(Debug, Identifiable, Queryable)]
#[table_name = "churches"]
pub struct Church {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Identifiable, Queryable)]
#[table_name = "accounts"]
pub struct Account {
    pub id: i32,
    pub name: String,
    pub role: String,
    pub church_id: Option<i32>,
    pub api_token: String,
}

/// A stored event. `status` is deliberately absent: it is derived from the
/// time window on every read, see `status::EventStatus::of`.
#[derive(Clone, Debug, Identifiable, Queryable)]
#[table_name = "events"]
pub struct Event {
    pub id: i32,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub link: Option<String>,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub organizer_id: i32,
    pub church_id: Option<i32>,
    pub cancelled_at: Option<NaiveDateTime>,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<i32>,
    pub interested_count: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Insertable)]
#[table_name = "events"]
pub struct NewEvent<'a> {
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub location: Option<&'a str>,
    pub link: Option<&'a str>,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub organizer_id: i32,
    pub church_id: Option<i32>,
    pub interested_count: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Associations, Debug, Identifiable, Queryable)]
#[belongs_to(Event)]
#[primary_key(event_id, device_id)]
#[table_name = "interests"]
pub struct Interest {
    pub event_id: i32,
    pub device_id: String,
    pub created_at: NaiveDateTime,
}

#[derive(Clone, Debug, Queryable)]
pub struct Device {
    pub device_id: String,
    pub push_token: String,
    pub platform: String,
    pub updated_at: NaiveDateTime,
}
