//! Scripted in-memory backend for tests
//!
//! Each `send` replays the next queued script onto the session's event stream.
//! Tests can also push events by hand through the `MemorySession` handle to
//! drive timing-sensitive paths (timeouts, stop, late events).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, ErrorKind, Result};
use crate::event::BackendEvent;
use crate::hub::{EventHub, Subscription};
use crate::{Backend, BackendSession, BoxFuture, EnvOverrides};

#[derive(Default)]
struct BackendState {
    scripts: VecDeque<Vec<BackendEvent>>,
    open_failures: VecDeque<Error>,
    send_failures: VecDeque<Error>,
    sessions: Vec<Arc<MemorySession>>,
    opened_with: Vec<EnvOverrides>,
}

/// Backend whose sessions replay queued event scripts.
#[derive(Clone)]
pub struct MemoryBackend {
    kind: String,
    use_account_pool: bool,
    state: Arc<Mutex<BackendState>>,
}

impl MemoryBackend {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            use_account_pool: false,
            state: Arc::new(Mutex::new(BackendState::default())),
        }
    }

    pub fn with_account_pool(mut self) -> Self {
        self.use_account_pool = true;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue the events the next `send` will replay, across all sessions.
    pub fn push_script(&self, events: Vec<BackendEvent>) {
        self.state().scripts.push_back(events);
    }

    /// Make the next `open_session` fail.
    pub fn fail_next_open(&self, error: Error) {
        self.state().open_failures.push_back(error);
    }

    /// Make the next `send` fail at submission.
    pub fn fail_next_send(&self, error: Error) {
        self.state().send_failures.push_back(error);
    }

    /// Sessions opened so far, oldest first.
    pub fn sessions(&self) -> Vec<Arc<MemorySession>> {
        self.state().sessions.clone()
    }

    /// Most recently opened session.
    pub fn last_session(&self) -> Option<Arc<MemorySession>> {
        self.state().sessions.last().cloned()
    }

    /// Environment overrides passed to each `open_session` call.
    pub fn opened_with(&self) -> Vec<EnvOverrides> {
        self.state().opened_with.clone()
    }
}

impl Backend for MemoryBackend {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn uses_account_pool(&self) -> bool {
        self.use_account_pool
    }

    fn open_session(&self, env: EnvOverrides) -> BoxFuture<'_, Result<Arc<dyn BackendSession>>> {
        Box::pin(async move {
            let mut state = self.state();
            state.opened_with.push(env);
            if let Some(err) = state.open_failures.pop_front() {
                return Err(err);
            }
            let session = Arc::new(MemorySession {
                id: format!("{}-session-{}", self.kind, state.sessions.len() + 1),
                backend: self.state.clone(),
                hub: EventHub::new(),
                sent: Mutex::new(Vec::new()),
                aborts: AtomicUsize::new(0),
                fail_abort: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            });
            state.sessions.push(session.clone());
            Ok(session as Arc<dyn BackendSession>)
        })
    }
}

/// A scripted session.
pub struct MemorySession {
    id: String,
    backend: Arc<Mutex<BackendState>>,
    hub: EventHub,
    sent: Mutex<Vec<String>>,
    aborts: AtomicUsize,
    fail_abort: AtomicBool,
    destroyed: AtomicBool,
}

impl MemorySession {
    /// Push an event to the active subscriber.
    pub fn emit(&self, event: BackendEvent) -> bool {
        self.hub.publish(event)
    }

    /// Prompts submitted so far.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    /// Make `abort` fail instead of emitting an aborted error.
    pub fn fail_aborts(&self) {
        self.fail_abort.store(true, Ordering::SeqCst);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn has_subscriber(&self) -> bool {
        self.hub.has_subscriber()
    }
}

impl BackendSession for MemorySession {
    fn session_id(&self) -> String {
        self.id.clone()
    }

    fn model(&self) -> Option<String> {
        Some("memory-model".into())
    }

    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    fn send(&self, prompt: &str) -> BoxFuture<'_, Result<()>> {
        let prompt = prompt.to_string();
        Box::pin(async move {
            if self.destroyed.load(Ordering::SeqCst) {
                return Err(Error::Closed("session destroyed".into()));
            }
            let script = {
                let mut state = self.backend.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(err) = state.send_failures.pop_front() {
                    return Err(err);
                }
                state.scripts.pop_front()
            };
            self.sent
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(prompt);
            for event in script.unwrap_or_default() {
                self.hub.publish(event);
            }
            Ok(())
        })
    }

    fn abort(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.aborts.fetch_add(1, Ordering::SeqCst);
            if self.fail_abort.load(Ordering::SeqCst) {
                return Err(Error::reported(ErrorKind::Other, "abort rejected"));
            }
            self.hub.publish(BackendEvent::Error(Error::reported(
                ErrorKind::Aborted,
                "request aborted",
            )));
            Ok(())
        })
    }

    fn destroy(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.destroyed.store(true, Ordering::SeqCst);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_scripts_in_order() {
        let backend = MemoryBackend::new("mem");
        backend.push_script(vec![BackendEvent::Idle]);

        let session = backend.open_session(EnvOverrides::new()).await.unwrap();
        let mut sub = session.subscribe();
        session.send("hello").await.unwrap();

        assert_eq!(sub.recv().await, Some(BackendEvent::Idle));
        assert_eq!(backend.last_session().unwrap().sent(), vec!["hello"]);
    }

    #[tokio::test]
    async fn queued_open_failure_is_returned_once() {
        let backend = MemoryBackend::new("mem");
        backend.fail_next_open(Error::Spawn("no agent".into()));

        assert!(backend.open_session(EnvOverrides::new()).await.is_err());
        assert!(backend.open_session(EnvOverrides::new()).await.is_ok());
        assert_eq!(backend.opened_with().len(), 2);
    }
}
