//! Streaming session engine and agent multiplexer
//!
//! `SessionEngine` drives one backend session: it opens it lazily (under the
//! account pool's credentials when the backend uses the pool), turns the
//! backend's event stream into segmented, throttled `StatusUpdate`s, and
//! settles every send exactly once on idle, error, timeout, or kill.
//!
//! `Multiplexer` routes each user to the engine for their preferred backend
//! kind. Callers only see the `AgentSession` trait.

pub mod engine;
pub mod error;
pub mod multiplexer;
pub mod segment;
pub mod status;

pub use engine::{EngineConfig, SessionEngine};
pub use error::{EngineError, MultiplexError, Result};
pub use multiplexer::Multiplexer;
pub use segment::{StatusUpdate, ThrottleConfig, UpdateKind};
pub use status::{SessionInfo, StatusReport};

use agent_backend::BoxFuture;
use tokio::sync::mpsc;

/// Channel the engine pushes caller-visible updates into.
pub type StatusSender = mpsc::UnboundedSender<StatusUpdate>;

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Abort was delivered; the running send will settle as cancelled.
    Stopped,
    /// Abort could not be delivered; the send may still complete.
    Pending,
    /// Nothing was running.
    NotRunning,
}

impl StopOutcome {
    /// Whether something was running when the stop arrived.
    pub fn was_running(&self) -> bool {
        !matches!(self, StopOutcome::NotRunning)
    }
}

/// Clears the engine's `processing` flag when dropped.
pub struct ProcessingGuard {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ProcessingGuard {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Release early.
    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Operations every agent session exposes to callers.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn AgentSession>`).
pub trait AgentSession: Send + Sync {
    /// Backend kind this session drives.
    fn kind(&self) -> &str;

    /// Whether sessions open under the account pool's credentials.
    fn uses_account_pool(&self) -> bool;

    /// Send a message and stream progress into `updates`. Resolves with the
    /// full response text once the turn completes.
    fn send_message_streaming<'a>(
        &'a self,
        message: &'a str,
        user: &'a str,
        updates: StatusSender,
    ) -> BoxFuture<'a, Result<String>>;

    /// Abort the running send, if any.
    fn stop(&self) -> BoxFuture<'_, StopOutcome>;

    /// Destroy the backend session. The next send opens a fresh one.
    fn kill(&self) -> BoxFuture<'_, ()>;

    /// Mark the session busy until the returned guard drops.
    fn start_processing(&self) -> ProcessingGuard;

    fn is_processing(&self) -> bool;

    fn clear_stop_requested(&self);

    /// Record that the running send is being superseded by a new message.
    fn mark_interrupt(&self);

    /// Read and clear the interrupt flag.
    fn consume_interrupt_flag(&self) -> bool;

    /// Diagnostic snapshot.
    fn info(&self) -> SessionInfo;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn processing_guard_releases_once() {
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let guard = ProcessingGuard::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        guard.release();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let counter = calls.clone();
        {
            let _guard = ProcessingGuard::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stop_outcome_running() {
        assert!(StopOutcome::Stopped.was_running());
        assert!(StopOutcome::Pending.was_running());
        assert!(!StopOutcome::NotRunning.was_running());
    }
}
