use crate::db::Database;
use crate::devices;
use crate::error::{Error, Result};
use crate::models::Event;

use diesel::sqlite::SqliteConnection;
use reqwest::header::AUTHORIZATION;
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Modified,
    Cancelled,
    Reminder,
    NewInfo,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Modified => "modified",
            NotificationKind::Cancelled => "cancelled",
            NotificationKind::Reminder => "reminder",
            NotificationKind::NewInfo => "new_info",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub event_id: i32,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub data: Value,
}

/// Builds the user-facing text for `kind`. `detail` is the cancellation
/// reason for `Cancelled` and the organizer's message for `Reminder` and
/// `NewInfo`; it is ignored for `Modified`.
pub fn compose(
    kind: NotificationKind,
    event: &Event,
    church_name: Option<&str>,
    detail: Option<&str>,
) -> Notification {
    let organizer = church_name.unwrap_or("The organizer");
    let mut data = json!({
        "eventId": event.id,
        "type": kind.as_str(),
    });
    let (title, body) = match kind {
        NotificationKind::Modified => (
            format!("Event updated: {}", event.title),
            format!("{} updated the details of \"{}\".", organizer, event.title),
        ),
        NotificationKind::Cancelled => {
            let reason = detail.unwrap_or_default();
            data["reason"] = json!(reason);
            (
                format!("Event cancelled: {}", event.title),
                format!("{} cancelled \"{}\". Reason: {}", organizer, event.title, reason),
            )
        }
        NotificationKind::Reminder => {
            let message = detail.unwrap_or_default();
            data["message"] = json!(message);
            (format!("Reminder: {}", event.title), message.to_owned())
        }
        NotificationKind::NewInfo => {
            let message = detail.unwrap_or_default();
            data["message"] = json!(message);
            (
                format!("News from {}: {}", organizer, event.title),
                message.to_owned(),
            )
        }
    };
    Notification {
        event_id: event.id,
        kind,
        title,
        body,
        data,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PushMessage {
    pub to: String,
    pub title: String,
    pub body: String,
    pub data: Value,
    pub sound: &'static str,
}

impl PushMessage {
    fn new(push_token: &str, notification: &Notification) -> PushMessage {
        PushMessage {
            to: push_token.to_owned(),
            title: notification.title.clone(),
            body: notification.body.clone(),
            data: notification.data.clone(),
            sound: "default",
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PushTicket {
    pub status: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<TicketDetails>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TicketDetails {
    #[serde(default)]
    pub error: Option<String>,
}

impl PushTicket {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    pub fn device_not_registered(&self) -> bool {
        self.details
            .as_ref()
            .and_then(|details| details.error.as_ref())
            .map(|error| error == "DeviceNotRegistered")
            .unwrap_or(false)
    }
}

pub trait PushGateway: Send {
    fn send(&self, messages: &[PushMessage]) -> Result<Vec<PushTicket>>;
}

pub struct ExpoGateway {
    client: reqwest::Client,
    url: String,
    access_token: Option<String>,
}

impl ExpoGateway {
    pub fn new(url: String, access_token: Option<String>) -> ExpoGateway {
        ExpoGateway {
            client: reqwest::Client::new(),
            url,
            access_token,
        }
    }
}

impl PushGateway for ExpoGateway {
    fn send(&self, messages: &[PushMessage]) -> Result<Vec<PushTicket>> {
        #[derive(Deserialize)]
        struct TicketsResponse {
            data: Vec<PushTicket>,
        }

        let mut request = self.client.post(&self.url).json(&messages);
        if let Some(token) = &self.access_token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let tickets = request
            .send()
            .map_err(Error::PushGateway)?
            .error_for_status()
            .map_err(Error::PushGateway)?
            .json::<TicketsResponse>()
            .map_err(Error::PushGateway)?;
        Ok(tickets.data)
    }
}

#[derive(Debug, Default, Eq, PartialEq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub failed: usize,
    pub pruned: usize,
}

/// Pushes `notification` to every interested device that has a push target,
/// in batches of at most `batch_size`. A failing batch does not stop the
/// remaining ones. Targets reported as unregistered are deleted.
pub fn deliver(
    conn: &SqliteConnection,
    gateway: &dyn PushGateway,
    batch_size: usize,
    notification: &Notification,
) -> Result<DeliveryReport> {
    let targets = devices::targets_for_event(conn, notification.event_id)?;
    let mut report = DeliveryReport::default();
    let mut unregistered = Vec::new();

    for batch in targets.chunks(batch_size.max(1)) {
        let messages: Vec<PushMessage> = batch
            .iter()
            .map(|device| PushMessage::new(&device.push_token, notification))
            .collect();
        let tickets = match gateway.send(&messages) {
            Ok(tickets) => tickets,
            Err(err) => {
                warn!(event_id = notification.event_id, targets = batch.len() as u64, error = %err, "push batch failed");
                report.failed += batch.len();
                continue;
            }
        };
        for (device, ticket) in batch.iter().zip(tickets.iter()) {
            if ticket.is_ok() {
                debug!(event_id = notification.event_id, device_id = %device.device_id, "push delivered");
                report.sent += 1;
            } else {
                warn!(
                    event_id = notification.event_id,
                    device_id = %device.device_id,
                    reason = ticket.message.as_ref().map(String::as_str).unwrap_or(""),
                    "push rejected"
                );
                report.failed += 1;
                if ticket.device_not_registered() {
                    unregistered.push(device.device_id.clone());
                }
            }
        }
        if tickets.len() < batch.len() {
            report.failed += batch.len() - tickets.len();
        }
    }

    report.pruned = devices::prune(conn, &unregistered)?;
    if report.pruned > 0 {
        info!(event_id = notification.event_id, pruned = report.pruned as u64, "pruned unregistered push targets");
    }
    Ok(report)
}

/// Hands notifications to the dispatch worker. Sending never blocks on
/// delivery and never fails the caller.
#[derive(Clone)]
pub struct Notifier {
    sender: Arc<Mutex<Sender<Notification>>>,
}

impl Notifier {
    pub fn start(
        database: Database,
        gateway: Box<dyn PushGateway>,
        batch_size: usize,
    ) -> Result<Notifier> {
        let (sender, receiver) = channel();
        thread::Builder::new()
            .name("push-dispatch".to_owned())
            .spawn(move || run_worker(&database, gateway.as_ref(), batch_size, receiver))
            .map_err(|err| Error::Inner(Box::new(err)))?;
        Ok(Notifier {
            sender: Arc::new(Mutex::new(sender)),
        })
    }

    #[cfg(test)]
    pub fn channel() -> (Notifier, Receiver<Notification>) {
        let (sender, receiver) = channel();
        (
            Notifier {
                sender: Arc::new(Mutex::new(sender)),
            },
            receiver,
        )
    }

    pub fn notify(&self, notification: Notification) {
        let event_id = notification.event_id;
        let kind = notification.kind.as_str();
        let queued = match self.sender.lock() {
            Ok(sender) => sender.send(notification).is_ok(),
            Err(_) => false,
        };
        if queued {
            debug!(event_id, kind, "notification queued");
        } else {
            error!(event_id, kind, "notification dropped: dispatch worker is gone");
        }
    }
}

fn run_worker(
    database: &Database,
    gateway: &dyn PushGateway,
    batch_size: usize,
    receiver: Receiver<Notification>,
) {
    for notification in receiver {
        let outcome = database
            .connect()
            .and_then(|conn| deliver(&conn, gateway, batch_size, &notification));
        match outcome {
            Ok(report) => info!(
                event_id = notification.event_id,
                kind = notification.kind.as_str(),
                sent = report.sent as u64,
                failed = report.failed as u64,
                "notification dispatched"
            ),
            Err(err) => error!(
                event_id = notification.event_id,
                kind = notification.kind.as_str(),
                error = %err,
                "notification dispatch failed"
            ),
        }
    }
    debug!("dispatch worker stopped");
}


#[cfg(test)]
mod tests {
    use super::testing::{ForwardingGateway, RecordingGateway};
    use super::*;
    use crate::clock::{test_time, FixedClock};
    use crate::db::test_connection;
    use crate::devices::{register, Platform, Registration};
    use crate::models::Device;
    use crate::schema::devices::dsl::devices;
    use crate::schema::interests::dsl as interest_dsl;
    use chrono::Duration;
    use diesel::prelude::*;

    fn event(id: i32, title: &str) -> Event {
        let now = test_time();
        Event {
            id,
            title: title.to_owned(),
            description: None,
            location: None,
            link: None,
            start_time: now + Duration::hours(1),
            end_time: now + Duration::hours(2),
            organizer_id: 1,
            church_id: None,
            cancelled_at: None,
            cancellation_reason: None,
            cancelled_by: None,
            interested_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn composes_cancellation_with_reason_and_church() {
        let notification = compose(
            NotificationKind::Cancelled,
            &event(7, "Harvest Supper"),
            Some("St Mary's"),
            Some("The hall roof is leaking"),
        );
        assert_eq!(notification.event_id, 7);
        assert_eq!(notification.title, "Event cancelled: Harvest Supper");
        assert_eq!(
            notification.body,
            "St Mary's cancelled \"Harvest Supper\". Reason: The hall roof is leaking"
        );
        assert_eq!(notification.data["type"], "cancelled");
        assert_eq!(notification.data["eventId"], 7);
        assert_eq!(notification.data["reason"], "The hall roof is leaking");
    }

    #[test]
    fn composes_modification_without_church() {
        let notification = compose(NotificationKind::Modified, &event(3, "Choir"), None, None);
        assert_eq!(notification.title, "Event updated: Choir");
        assert_eq!(notification.body, "The organizer updated the details of \"Choir\".");
        assert!(notification.data.get("reason").is_none());
    }

    #[test]
    fn kinds_serialize_in_snake_case() {
        assert_eq!(serde_json::to_string(&NotificationKind::NewInfo).unwrap(), "\"new_info\"");
        let kind: NotificationKind = serde_json::from_str("\"reminder\"").unwrap();
        assert_eq!(kind, NotificationKind::Reminder);
    }

    #[test]
    fn parses_gateway_tickets() {
        let body = r#"{"data": [
            {"status": "ok", "id": "abc"},
            {"status": "error", "message": "gone", "details": {"error": "DeviceNotRegistered"}},
            {"status": "error", "message": "too big", "details": {"error": "MessageTooBig"}}
        ]}"#;
        #[derive(Deserialize)]
        struct Tickets {
            data: Vec<PushTicket>,
        }
        let tickets: Tickets = serde_json::from_str(body).unwrap();
        assert!(tickets.data[0].is_ok());
        assert!(tickets.data[1].device_not_registered());
        assert!(!tickets.data[2].device_not_registered());
    }

    fn seed_interested_devices(conn: &SqliteConnection, event_id: i32, ids: &[&str]) {
        use crate::auth::fixtures;
        use crate::schema::events::dsl as event_dsl;

        let clock = FixedClock(test_time());
        let pastor = fixtures::pastor(conn, "St Mary's");
        let template = event(event_id, "Choir");
        diesel::insert_into(event_dsl::events)
            .values((
                event_dsl::id.eq(event_id),
                event_dsl::title.eq(&template.title),
                event_dsl::start_time.eq(template.start_time),
                event_dsl::end_time.eq(template.end_time),
                event_dsl::organizer_id.eq(pastor.id),
                event_dsl::created_at.eq(template.created_at),
                event_dsl::updated_at.eq(template.updated_at),
            ))
            .execute(conn)
            .unwrap();
        for id in ids {
            register(
                conn,
                &clock,
                Registration {
                    device_id: Some((*id).to_owned()),
                    push_token: Some(format!("token-{}", id)),
                    platform: Some(Platform::Ios),
                },
            )
            .unwrap();
            diesel::insert_into(interest_dsl::interests)
                .values((
                    interest_dsl::event_id.eq(event_id),
                    interest_dsl::device_id.eq(*id),
                    interest_dsl::created_at.eq(test_time()),
                ))
                .execute(conn)
                .unwrap();
        }
    }

    #[test]
    fn delivers_in_batches_and_prunes_dead_targets() {
        let conn = test_connection();
        seed_interested_devices(&conn, 5, &["a", "b", "c"]);
        let mut gateway = RecordingGateway::default();
        gateway.dead_tokens.insert("token-b".to_owned());

        let notification = compose(NotificationKind::Modified, &event(5, "Choir"), None, None);
        let report = deliver(&conn, &gateway, 2, &notification).unwrap();

        assert_eq!(
            report,
            DeliveryReport {
                sent: 2,
                failed: 1,
                pruned: 1
            }
        );
        let batches = gateway.batches.borrow();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[0][0].title, "Event updated: Choir");

        let left: Vec<String> = devices
            .load::<Device>(&conn)
            .unwrap()
            .into_iter()
            .map(|device| device.device_id)
            .collect();
        assert_eq!(left, vec!["a".to_owned(), "c".to_owned()]);
    }

    #[test]
    fn gateway_failure_is_counted_not_raised() {
        let conn = test_connection();
        seed_interested_devices(&conn, 5, &["a", "b"]);
        let gateway = RecordingGateway {
            fail_all: true,
            ..RecordingGateway::default()
        };

        let notification = compose(NotificationKind::Modified, &event(5, "Choir"), None, None);
        let report = deliver(&conn, &gateway, 100, &notification).unwrap();

        assert_eq!(report.sent, 0);
        assert_eq!(report.failed, 2);
        assert_eq!(report.pruned, 0);
    }

    #[test]
    fn nobody_interested_sends_nothing() {
        let conn = test_connection();
        let gateway = RecordingGateway::default();
        let notification = compose(NotificationKind::Modified, &event(5, "Choir"), None, None);

        assert_eq!(deliver(&conn, &gateway, 100, &notification).unwrap(), DeliveryReport::default());
        assert!(gateway.batches.borrow().is_empty());
    }

    #[test]
    fn worker_delivers_queued_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let database = Database::new(dir.path().join("events.sqlite"), 5000);
        database.migrate().unwrap();
        seed_interested_devices(&database.connect().unwrap(), 5, &["a", "b"]);

        let (sent, batches) = channel();
        let gateway = ForwardingGateway {
            sent: Mutex::new(sent),
        };
        let notifier = Notifier::start(database, Box::new(gateway), 100).unwrap();
        notifier.notify(compose(
            NotificationKind::Reminder,
            &event(5, "Choir"),
            Some("St Mary's"),
            Some("Rehearsal moves to the crypt"),
        ));

        let batch = batches
            .recv_timeout(std::time::Duration::from_secs(10))
            .unwrap();
        let mut targets: Vec<&str> = batch.iter().map(|message| message.to.as_str()).collect();
        targets.sort();
        assert_eq!(targets, vec!["token-a", "token-b"]);
        assert_eq!(batch[0].title, "Reminder: Choir");
        assert_eq!(batch[0].body, "Rehearsal moves to the crypt");

        drop(notifier);
        assert!(batches
            .recv_timeout(std::time::Duration::from_secs(10))
            .is_err());
    }

    #[test]
    fn notify_without_worker_only_logs() {
        let (notifier, receiver) = Notifier::channel();
        drop(receiver);
        notifier.notify(compose(NotificationKind::Modified, &event(1, "Choir"), None, None));
    }
}
