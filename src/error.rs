use gotham::helpers::http::response::create_response;
use gotham::state::State;
use hyper::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing or invalid credentials")]
    Unauthorized,
    #[error("Not allowed: {0}")]
    Forbidden(String),
    #[error("Event not found: {0}")]
    EventNotFound(i32),
    #[error("Church not found: {0}")]
    ChurchNotFound(i32),
    #[error("{0}")]
    InvalidState(String),
    #[error("The event is already cancelled")]
    AlreadyCancelled,
    #[error("The event is not cancelled")]
    NotCancelled,
    #[error("The event has already ended")]
    AlreadyCompleted,
    #[error("The event is cancelled and no longer accepts interest")]
    EventCancelled,
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error("Missing field{}: {}", plural(.0), .0.join(", "))]
    MissingFieldError(Vec<String>),
    #[error("Malformed request body")]
    BadRequestBody(#[source] serde_json::Error),
    #[error("Error occurred delivering push notifications")]
    PushGateway(#[source] reqwest::Error),
    #[error("Configuration error")]
    Config(#[source] config::ConfigError),
    #[error("Database connection error")]
    DatabaseConnection(#[source] diesel::ConnectionError),
    #[error("Database error")]
    Database(#[source] diesel::result::Error),
    #[error("Database migration error")]
    Migration(#[source] diesel_migrations::RunMigrationsError),
    #[error("Unexpected error")]
    Inner(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn as_response(&self, state: &State) -> http::Response<hyper::Body> {
        create_response(
            &state,
            self.status_code(),
            mime::TEXT_PLAIN_UTF_8,
            format!("Error: {}", self),
        )
    }

    pub fn status_code(&self) -> StatusCode {
        use Error::*;
        match self {
            Unauthorized => StatusCode::UNAUTHORIZED,
            Forbidden(..) => StatusCode::FORBIDDEN,
            EventNotFound(..) | ChurchNotFound(..) => StatusCode::NOT_FOUND,
            InvalidState(..) | AlreadyCancelled | NotCancelled | AlreadyCompleted
            | EventCancelled => StatusCode::CONFLICT,
            Validation(..) | MissingFieldError(..) | BadRequestBody(..) => StatusCode::BAD_REQUEST,
            PushGateway(..) | Config(..) | DatabaseConnection(..) | Database(..)
            | Migration(..) | Inner(..) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for the storage and infrastructure failures whose details stay
    /// out of responses.
    pub fn is_internal(&self) -> bool {
        self.status_code() == StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn plural(fields: &[String]) -> &'static str {
    if fields.len() == 1 {
        ""
    } else {
        "s"
    }
}

impl From<diesel::result::Error> for Error {
    fn from(err: diesel::result::Error) -> Error {
        Error::Database(err)
    }
}
