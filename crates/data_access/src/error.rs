//! Errors returned by the data-access layer.
//!
//! Every remote call returns [`Result`]; nothing is swallowed except a
//! delete of an id that is already gone (see [`DeletePolicy`]).
//!
//! [`DeletePolicy`]: crate::DeletePolicy
use api_types::Collection;
use reqwest::StatusCode;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Endpoint or credential absent or malformed. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Missing or invalid fields, detected before any remote call.
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{collection} record {id} not found")]
    NotFound { collection: Collection, id: Uuid },
    /// Non-2xx answer from the service.
    #[error("remote error {status}: {message}")]
    Remote { status: StatusCode, message: String },
    /// The request never produced a status (connect, timeout, body decode).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
}

impl Error {
    /// Whether repeating the same idempotent read may succeed.
    ///
    /// Writes are never retried by this crate regardless of the answer.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => !err.is_decode() && !err.is_builder(),
            Self::Remote { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Remote { status, .. } => Some(*status),
            Self::Auth(AuthError::Rejected { status, .. }) => Some(*status),
            Self::Transport(err) => err.status(),
            _ => None,
        }
    }
}

/// Failures at the authentication boundary.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no signed-in session")]
    NoSession,
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("auth service rejected the request ({status}): {message}")]
    Rejected { status: StatusCode, message: String },
}

/// Failures of a change stream, delivered to the subscriber as events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("failed to open change stream: {0}")]
    Connect(String),
    #[error("change stream join rejected: {0}")]
    Rejected(String),
    #[error("change stream dropped: {0}")]
    Dropped(String),
    #[error("undecodable change notification: {0}")]
    Decode(String),
    #[error("gave up reconnecting after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

impl SubscriptionError {
    /// Whether the stream that produced this error is unusable.
    pub fn ends_stream(&self) -> bool {
        !matches!(self, Self::Decode(_))
    }
}
