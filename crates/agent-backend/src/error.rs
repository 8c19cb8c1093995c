//! Error types for backend operations

use serde::{Deserialize, Serialize};

/// Classification of a backend failure, used to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The agent process died or its session became unusable. Retry once on a
    /// fresh session.
    Crashed,
    /// The upstream provider rejected the account for rate or quota reasons.
    RateLimited,
    /// The running operation was aborted on request.
    Aborted,
    /// Anything else; surfaced to the user as-is.
    Other,
}

impl ErrorKind {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Crashed => "crashed",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Aborted => "aborted",
            ErrorKind::Other => "other",
        }
    }
}

/// Errors from backend operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("failed to start agent: {0}")]
    Spawn(String),

    #[error("agent session closed: {0}")]
    Closed(String),

    #[error("agent I/O error: {0}")]
    Io(String),

    /// An error the agent reported on its event stream.
    #[error("{message}")]
    Reported { kind: ErrorKind, message: String },
}

impl Error {
    /// Build a reported error with an explicit classification.
    pub fn reported(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::Reported {
            kind,
            message: message.into(),
        }
    }

    /// Recovery classification for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Spawn(_) => ErrorKind::Other,
            Error::Closed(_) => ErrorKind::Crashed,
            Error::Io(_) => ErrorKind::Crashed,
            Error::Reported { kind, .. } => *kind,
        }
    }
}

/// Result alias for backend operations.
pub type Result<T> = std::result::Result<T, Error>;
