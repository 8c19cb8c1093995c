//! Error types for session-engine operations

use std::time::Duration;

use agent_backend::ErrorKind;

/// Outcome of a failed send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The backend session could not be opened.
    #[error("failed to start agent session: {0}")]
    Initialization(String),

    /// The backend reported a failure for this turn.
    #[error("{message}")]
    Session { kind: ErrorKind, message: String },

    /// No terminal event arrived within the configured window.
    #[error("no response from agent within {}s", .0.as_secs())]
    Timeout(Duration),

    /// The turn was aborted by a stop or interrupt request.
    #[error("{}", cancel_message(.interrupted))]
    Cancelled { interrupted: bool },

    /// Rotation found no eligible account.
    #[error("all accounts are rate limited")]
    AllAccountsLimited,
}

impl EngineError {
    /// Backend classification, for errors that carry one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            EngineError::Session { kind, .. } => Some(*kind),
            EngineError::AllAccountsLimited => Some(ErrorKind::RateLimited),
            EngineError::Cancelled { .. } => Some(ErrorKind::Aborted),
            _ => None,
        }
    }

    pub fn is_crash(&self) -> bool {
        matches!(
            self,
            EngineError::Session {
                kind: ErrorKind::Crashed,
                ..
            }
        )
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            EngineError::Session {
                kind: ErrorKind::RateLimited,
                ..
            }
        )
    }

    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::Initialization(_) => "init_failed",
            EngineError::Session { kind, .. } => kind.label(),
            EngineError::Timeout(_) => "timeout",
            EngineError::Cancelled { .. } => "cancelled",
            EngineError::AllAccountsLimited => "all_accounts_limited",
        }
    }
}

fn cancel_message(interrupted: &bool) -> &'static str {
    if *interrupted {
        "query interrupted"
    } else {
        "query stopped"
    }
}

/// Result alias for session-engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors from multiplexer preference handling.
#[derive(Debug, thiserror::Error)]
pub enum MultiplexError {
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("no engine registered for default backend {0}")]
    MissingDefault(String),

    #[error("duplicate engine for backend {0}")]
    DuplicateBackend(String),

    #[error(transparent)]
    Persist(#[from] common::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            EngineError::Timeout(Duration::from_secs(300)).to_string(),
            "no response from agent within 300s"
        );
        assert_eq!(
            EngineError::Cancelled { interrupted: true }.to_string(),
            "query interrupted"
        );
        assert_eq!(
            EngineError::Session {
                kind: ErrorKind::Other,
                message: "boom".into()
            }
            .to_string(),
            "boom"
        );
    }

    #[test]
    fn classification_helpers() {
        let crash = EngineError::Session {
            kind: ErrorKind::Crashed,
            message: "exited".into(),
        };
        assert!(crash.is_crash());
        assert!(!crash.is_rate_limit());
        assert_eq!(crash.label(), "crashed");

        let limited = EngineError::Session {
            kind: ErrorKind::RateLimited,
            message: "429".into(),
        };
        assert!(limited.is_rate_limit());
        assert_eq!(EngineError::Timeout(Duration::ZERO).kind(), None);
    }
}
