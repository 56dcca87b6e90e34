// ===============================
// src/error.rs
// ===============================
use hyper::StatusCode;
use thiserror::Error;

/// Validation / routing errors returned synchronously to relay callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("missing accountId")]
    MissingAccountId,
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("unknown order type '{0}'")]
    UnknownOrderType(String),
    #[error("account {account} is not authorized")]
    Unauthorized { account: String, allowed: Vec<String> },
    #[error("no account mapping for follower {account}")]
    NoMapping { account: String },
    #[error("duplicate message {key}")]
    DuplicateMessage { key: String },
}

impl RelayError {
    /// HTTP-equivalent status. Duplicates are a soft "not added" outcome.
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::MissingAccountId
            | RelayError::InvalidEvent(_)
            | RelayError::UnknownOrderType(_) => StatusCode::BAD_REQUEST,
            RelayError::Unauthorized { .. } | RelayError::NoMapping { .. } => StatusCode::FORBIDDEN,
            RelayError::DuplicateMessage { .. } => StatusCode::OK,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::MissingAccountId => "missing_account_id",
            RelayError::InvalidEvent(_) => "invalid_event",
            RelayError::UnknownOrderType(_) => "unknown_order_type",
            RelayError::Unauthorized { .. } => "unauthorized",
            RelayError::NoMapping { .. } => "no_mapping",
            RelayError::DuplicateMessage { .. } => "duplicate",
        }
    }
}

/// Failure reported by an execution engine call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} failed: {reason}")]
pub struct EngineError {
    pub operation: &'static str,
    pub reason: String,
}

impl EngineError {
    pub fn new(operation: &'static str, reason: impl Into<String>) -> Self {
        Self { operation, reason: reason.into() }
    }
}

/// Errors absorbed at the dispatch boundary (counted + logged, never raised).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),
    #[error("unknown order type '{0}'")]
    UnknownOrderType(String),
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("invalid volume {0}")]
    InvalidVolume(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<RelayError> for DispatchError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::UnknownOrderType(t) => DispatchError::UnknownOrderType(t),
            other => DispatchError::InvalidEvent(other.to_string()),
        }
    }
}

/// Follower-side round-trip failures; each one is a RequestFailed cycle.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("request timed out")]
    Timeout,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("dispatch loop stopped")]
    DispatcherStopped,
}

/// Anything that stops a role from starting or makes it exit early.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("config: {0}")]
    Config(String),
    #[error("relay server: {0}")]
    Server(#[from] hyper::Error),
    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error(transparent)]
    Poll(#[from] PollError),
}
