//! Backend abstraction for AI coding-agent sessions
//!
//! Defines the `Backend` and `BackendSession` traits that decouple the session
//! engine from how an agent is actually driven. `ProcessBackend` runs an agent
//! CLI as a child process speaking line-delimited JSON; the engine never sees
//! the wire format, only the typed `BackendEvent` vocabulary.
//!
//! Every error a backend reports carries an `ErrorKind` so callers can branch on
//! crash / rate-limit / abort without matching on message text:
//! - Crashed triggers one retry on a fresh session
//! - RateLimited triggers account rotation
//! - Aborted is the expected outcome of a stop or interrupt

pub mod classify;
pub mod error;
pub mod event;
pub mod hub;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod process;
mod wire;

pub use classify::classify_message;
pub use error::{Error, ErrorKind, Result};
pub use event::{BackendEvent, Usage};
pub use hub::{EventHub, Subscription};
pub use process::{ProcessBackend, ProcessBackendConfig};

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future used by the dyn-compatible backend traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Environment overrides applied when a backend opens a session.
pub type EnvOverrides = HashMap<String, String>;

/// A factory for agent sessions of one backend kind.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Backend>`).
pub trait Backend: Send + Sync {
    /// Backend kind identifier (e.g. "claude", "codex") used for routing.
    fn kind(&self) -> &str;

    /// Whether sessions of this backend should run under the account pool's
    /// credential overrides.
    fn uses_account_pool(&self) -> bool;

    /// Open a new conversational session. `env` carries the credential
    /// overrides for the current account, or is empty to use the process
    /// defaults.
    fn open_session(&self, env: EnvOverrides) -> BoxFuture<'_, Result<Arc<dyn BackendSession>>>;
}

/// One live conversation against a backend.
pub trait BackendSession: Send + Sync {
    /// Backend-assigned session identifier.
    fn session_id(&self) -> String;

    /// Model the backend reported for this session, if any.
    fn model(&self) -> Option<String>;

    /// Attach an event listener. Only the newest subscription receives events.
    fn subscribe(&self) -> Subscription;

    /// Submit a user message. Completion means the backend accepted it; the
    /// reply arrives as events on the active subscription.
    fn send(&self, prompt: &str) -> BoxFuture<'_, Result<()>>;

    /// Abort the operation in progress.
    fn abort(&self) -> BoxFuture<'_, Result<()>>;

    /// Tear the session down. Idempotent.
    fn destroy(&self) -> BoxFuture<'_, ()>;
}
