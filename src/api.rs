use crate::auth::{authenticate, bearer_token, Actor};
use crate::clock::Clock;
use crate::db::Database;
use crate::devices::{self, Registration};
use crate::error::{Error, Result};
use crate::events::{EventFilter, EventUpdate, Events, NewEventRequest};
use crate::interest;
use crate::notify::{NotificationKind, Notifier};
use crate::status::EventStatus;

use diesel::sqlite::SqliteConnection;
use futures::{Future, Stream};
use gotham::handler::{HandlerError, HandlerFuture};
use gotham::helpers::http::response::{create_empty_response, create_response};
use gotham::middleware::state::StateMiddleware;
use gotham::pipeline::new_pipeline;
use gotham::pipeline::single::single_pipeline;
use gotham::router::{builder::*, Router};
use gotham::state::{FromState, State};
use gotham_derive::{StateData, StaticResponseExtender};
use hyper::{Body, HeaderMap, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

/// Handles shared by every request.
#[derive(Clone, StateData)]
pub struct AppState {
    pub database: Database,
    pub clock: Arc<dyn Clock>,
    pub notifier: Notifier,
}

impl AppState {
    fn events<'a>(&'a self, conn: &'a SqliteConnection) -> Events<'a> {
        Events::new(conn, self.clock.as_ref(), &self.notifier)
    }
}

pub fn router(app: AppState) -> Router {
    let (chain, pipelines) = single_pipeline(new_pipeline().add(StateMiddleware::new(app)).build());

    build_router(chain, pipelines, |route| {
        route
            .get("/events")
            .with_query_string_extractor::<EventsQuery>()
            .to(list_events);
        route.post("/events").to(create_event);
        route
            .get("/my/events")
            .with_query_string_extractor::<EventsQuery>()
            .to(list_my_events);

        route
            .get("/events/:id")
            .with_path_extractor::<EventPath>()
            .to(get_event);
        route
            .put("/events/:id")
            .with_path_extractor::<EventPath>()
            .to(edit_event);
        route
            .delete("/events/:id")
            .with_path_extractor::<EventPath>()
            .to(delete_event);
        route
            .post("/events/:id/cancel")
            .with_path_extractor::<EventPath>()
            .to(cancel_event);
        route
            .post("/events/:id/reactivate")
            .with_path_extractor::<EventPath>()
            .to(reactivate_event);
        route
            .post("/events/:id/notify")
            .with_path_extractor::<EventPath>()
            .to(announce);

        route
            .get("/events/:id/interest")
            .with_path_extractor::<EventPath>()
            .to(interest_count);
        route
            .post("/events/:id/interest")
            .with_path_extractor::<EventPath>()
            .to(join_interest);
        route
            .get("/events/:id/interest/:device_id")
            .with_path_extractor::<InterestPath>()
            .to(is_interested);
        route
            .delete("/events/:id/interest/:device_id")
            .with_path_extractor::<InterestPath>()
            .to(leave_interest);

        route.post("/devices").to(register_device);
        route
            .delete("/devices/:device_id")
            .with_path_extractor::<DevicePath>()
            .to(unregister_device);
    })
}

#[derive(Deserialize, StateData, StaticResponseExtender)]
struct EventPath {
    id: i32,
}

#[derive(Deserialize, StateData, StaticResponseExtender)]
struct InterestPath {
    id: i32,
    device_id: String,
}

#[derive(Deserialize, StateData, StaticResponseExtender)]
struct DevicePath {
    device_id: String,
}

#[derive(Deserialize, StateData, StaticResponseExtender)]
struct EventsQuery {
    church_id: Option<i32>,
    status: Option<String>,
}

impl EventsQuery {
    fn wanted_status(&self) -> Result<Option<EventStatus>> {
        self.status
            .as_ref()
            .map(|status| status.parse::<EventStatus>())
            .transpose()
    }
}

#[derive(Deserialize)]
struct CancelRequest {
    reason: Option<String>,
}

#[derive(Deserialize)]
struct InterestRequest {
    device_id: Option<String>,
}

#[derive(Deserialize)]
struct AnnounceRequest {
    kind: Option<NotificationKind>,
    message: Option<String>,
}

#[derive(Serialize)]
struct InterestedResponse<'a> {
    event_id: i32,
    device_id: &'a str,
    interested: bool,
}

fn json_response<T: serde::Serialize>(state: &State, status: StatusCode, body: &T) -> Result<Response<Body>> {
    let body = serde_json::to_vec(body).map_err(|err| Error::Inner(Box::new(err)))?;
    Ok(create_response(state, status, mime::APPLICATION_JSON, body))
}

fn error_response(state: &State, err: Error) -> Response<Body> {
    if err.is_internal() {
        match std::error::Error::source(&err) {
            Some(source) => error!(error = %err, source = %source, "request failed"),
            None => error!(error = %err, "request failed"),
        }
    }
    err.as_response(state)
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(Error::BadRequestBody)
}

fn actor(state: &State, conn: &SqliteConnection) -> Result<Actor> {
    authenticate(conn, bearer_token(HeaderMap::borrow_from(state)))
}

/// Runs `handler` for requests without a body.
fn respond<F>(state: State, handler: F) -> (State, Response<Body>)
where
    F: FnOnce(&State) -> Result<Response<Body>>,
{
    let response = handler(&state).unwrap_or_else(|err| error_response(&state, err));
    (state, response)
}

/// Reads the whole request body, then runs `handler` with it.
fn with_body<F>(mut state: State, handler: F) -> Box<HandlerFuture>
where
    F: FnOnce(&State, &[u8]) -> Result<Response<Body>> + Send + 'static,
{
    let f = Body::take_from(&mut state).concat2().then(move |body| {
        let response = match body {
            Ok(body) => handler(&state, &body).unwrap_or_else(|err| error_response(&state, err)),
            Err(err) => error_response(&state, Error::Inner(Box::new(err))),
        };
        Ok::<_, (State, HandlerError)>((state, response))
    });
    Box::new(f)
}

fn list_events(state: State) -> (State, Response<Body>) {
    respond(state, |state| {
        let query = EventsQuery::borrow_from(state);
        let filter = EventFilter {
            church_id: query.church_id,
            status: query.wanted_status()?,
        };
        let app = AppState::borrow_from(state);
        let conn = app.database.connect()?;
        json_response(state, StatusCode::OK, &app.events(&conn).list(&filter)?)
    })
}

fn list_my_events(state: State) -> (State, Response<Body>) {
    respond(state, |state| {
        let app = AppState::borrow_from(state);
        let conn = app.database.connect()?;
        let actor = actor(state, &conn)?;
        let wanted = EventsQuery::borrow_from(state).wanted_status()?;
        json_response(state, StatusCode::OK, &app.events(&conn).list_mine(&actor, wanted)?)
    })
}

fn get_event(state: State) -> (State, Response<Body>) {
    respond(state, |state| {
        let id = EventPath::borrow_from(state).id;
        let app = AppState::borrow_from(state);
        let conn = app.database.connect()?;
        json_response(state, StatusCode::OK, &app.events(&conn).get(id)?)
    })
}

fn create_event(state: State) -> Box<HandlerFuture> {
    with_body(state, |state, body| {
        let app = AppState::borrow_from(state);
        let conn = app.database.connect()?;
        let actor = actor(state, &conn)?;
        let request: NewEventRequest = parse(body)?;
        json_response(state, StatusCode::CREATED, &app.events(&conn).create(&actor, request)?)
    })
}

fn edit_event(state: State) -> Box<HandlerFuture> {
    with_body(state, |state, body| {
        let id = EventPath::borrow_from(state).id;
        let app = AppState::borrow_from(state);
        let conn = app.database.connect()?;
        let actor = actor(state, &conn)?;
        let update: EventUpdate = parse(body)?;
        json_response(state, StatusCode::OK, &app.events(&conn).edit(&actor, id, update)?)
    })
}

fn cancel_event(state: State) -> Box<HandlerFuture> {
    with_body(state, |state, body| {
        let id = EventPath::borrow_from(state).id;
        let app = AppState::borrow_from(state);
        let conn = app.database.connect()?;
        let actor = actor(state, &conn)?;
        let request: CancelRequest = parse(body)?;
        let view = app
            .events(&conn)
            .cancel(&actor, id, request.reason.as_ref().map(String::as_str))?;
        json_response(state, StatusCode::OK, &view)
    })
}

fn reactivate_event(state: State) -> (State, Response<Body>) {
    respond(state, |state| {
        let id = EventPath::borrow_from(state).id;
        let app = AppState::borrow_from(state);
        let conn = app.database.connect()?;
        let actor = actor(state, &conn)?;
        json_response(state, StatusCode::OK, &app.events(&conn).reactivate(&actor, id)?)
    })
}

fn delete_event(state: State) -> (State, Response<Body>) {
    respond(state, |state| {
        let id = EventPath::borrow_from(state).id;
        let app = AppState::borrow_from(state);
        let conn = app.database.connect()?;
        let actor = actor(state, &conn)?;
        app.events(&conn).delete(&actor, id)?;
        Ok(create_empty_response(state, StatusCode::NO_CONTENT))
    })
}

fn announce(state: State) -> Box<HandlerFuture> {
    with_body(state, |state, body| {
        let id = EventPath::borrow_from(state).id;
        let app = AppState::borrow_from(state);
        let conn = app.database.connect()?;
        let actor = actor(state, &conn)?;
        let request: AnnounceRequest = parse(body)?;
        app.events(&conn).announce(
            &actor,
            id,
            request.kind,
            request.message.as_ref().map(String::as_str),
        )?;
        Ok(create_empty_response(state, StatusCode::ACCEPTED))
    })
}

fn interest_count(state: State) -> (State, Response<Body>) {
    respond(state, |state| {
        let id = EventPath::borrow_from(state).id;
        let conn = AppState::borrow_from(state).database.connect()?;
        json_response(state, StatusCode::OK, &interest::count(&conn, id)?)
    })
}

fn join_interest(state: State) -> Box<HandlerFuture> {
    with_body(state, |state, body| {
        let id = EventPath::borrow_from(state).id;
        let request: InterestRequest = parse(body)?;
        let device_id = request
            .device_id
            .ok_or_else(|| Error::MissingFieldError(vec!["device_id".to_owned()]))?;
        let app = AppState::borrow_from(state);
        let conn = app.database.connect()?;
        let joined = interest::join(&conn, app.clock.as_ref(), id, &device_id)?;
        json_response(state, StatusCode::OK, &joined)
    })
}

fn leave_interest(state: State) -> (State, Response<Body>) {
    respond(state, |state| {
        let path = InterestPath::borrow_from(state);
        let conn = AppState::borrow_from(state).database.connect()?;
        json_response(state, StatusCode::OK, &interest::leave(&conn, path.id, &path.device_id)?)
    })
}

fn is_interested(state: State) -> (State, Response<Body>) {
    respond(state, |state| {
        let path = InterestPath::borrow_from(state);
        let conn = AppState::borrow_from(state).database.connect()?;
        let interested = interest::is_interested(&conn, path.id, &path.device_id)?;
        json_response(
            state,
            StatusCode::OK,
            &InterestedResponse {
                event_id: path.id,
                device_id: &path.device_id,
                interested,
            },
        )
    })
}

fn register_device(state: State) -> Box<HandlerFuture> {
    with_body(state, |state, body| {
        let registration: Registration = parse(body)?;
        let app = AppState::borrow_from(state);
        let conn = app.database.connect()?;
        devices::register(&conn, app.clock.as_ref(), registration)?;
        Ok(create_empty_response(state, StatusCode::NO_CONTENT))
    })
}

fn unregister_device(state: State) -> (State, Response<Body>) {
    respond(state, |state| {
        let device_id = &DevicePath::borrow_from(state).device_id;
        let conn = AppState::borrow_from(state).database.connect()?;
        devices::unregister(&conn, device_id)?;
        Ok(create_empty_response(state, StatusCode::NO_CONTENT))
    })
}
