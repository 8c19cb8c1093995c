//! Session engine: one lazily opened backend session and its send loop
//!
//! Send lifecycle:
//! 1. Open the backend session if there is none (pool credentials applied)
//! 2. Mark the query started and build the prompt (date/time context on the
//!    first message of a session)
//! 3. Subscribe, submit, and consume events until idle or error
//! 4. Settle exactly once: idle, error, submission failure, timeout, or kill.
//!    The subscription is released at settlement, so late events are dropped.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use account_pool::AccountPool;
use agent_backend::{
    Backend, BackendEvent, BackendSession, BoxFuture, EnvOverrides, ErrorKind, Subscription, Usage,
};
use chrono::{DateTime, FixedOffset, Local, Utc};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::segment::{Segmenter, StatusUpdate, ThrottleConfig};
use crate::status::SessionInfo;
use crate::{AgentSession, ProcessingGuard, StatusSender, StopOutcome};

/// Absolute per-send timeout when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Returned when a turn completes without any text.
pub const FALLBACK_RESPONSE: &str = "(no response)";

const ERROR_MAX_CHARS: usize = 100;

/// Engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub timeout: Duration,
    pub throttle: ThrottleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            throttle: ThrottleConfig::default(),
        }
    }
}

#[derive(Default)]
struct SessionState {
    handle: Option<Arc<dyn BackendSession>>,
    session_id: Option<String>,
    model: Option<String>,
    needs_context: bool,
    processing: bool,
    stop_requested: bool,
    interrupt_flag: bool,
    query_started: Option<DateTime<Utc>>,
    last_activity: Option<DateTime<Utc>>,
    current_tool: Option<String>,
    last_tool: Option<String>,
    last_error: Option<String>,
    last_error_time: Option<DateTime<Utc>>,
    last_usage: Option<Usage>,
    last_message: Option<String>,
    conversation_title: Option<String>,
    cancel: Option<oneshot::Sender<()>>,
}

impl SessionState {
    fn record_error(&mut self, message: &str) {
        self.last_error = Some(message.chars().take(ERROR_MAX_CHARS).collect());
        self.last_error_time = Some(Utc::now());
    }

    fn end_query(&mut self) {
        self.processing = false;
        self.query_started = None;
        self.current_tool = None;
        self.cancel = None;
    }

    fn reset_session(&mut self) {
        self.session_id = None;
        self.model = None;
        self.needs_context = false;
        self.last_activity = None;
        self.conversation_title = None;
        self.last_message = None;
        self.end_query();
    }
}

/// How a send ended, before it is turned into the caller's result.
enum Outcome {
    Completed(String),
    Failed(agent_backend::Error),
    TimedOut,
    Killed,
}

/// Drives one backend session for every user routed to this backend kind.
pub struct SessionEngine {
    backend: Arc<dyn Backend>,
    pool: Option<Arc<AccountPool>>,
    config: EngineConfig,
    state: Arc<Mutex<SessionState>>,
    open_lock: tokio::sync::Mutex<()>,
}

impl SessionEngine {
    pub fn new(backend: Arc<dyn Backend>, config: EngineConfig) -> Self {
        Self {
            backend,
            pool: None,
            config,
            state: Arc::new(Mutex::new(SessionState::default())),
            open_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open sessions under the pool's current account, if the backend uses it.
    pub fn with_pool(mut self, pool: Arc<AccountPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn kind(&self) -> &str {
        self.backend.kind()
    }

    pub fn uses_account_pool(&self) -> bool {
        self.pool.is_some() && self.backend.uses_account_pool()
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        lock_state(&self.state)
    }

    /// Send `message` and stream progress into `updates`.
    pub async fn send_message_streaming(
        &self,
        message: &str,
        user: &str,
        updates: StatusSender,
    ) -> Result<String> {
        let session = self.ensure_session().await?;
        let (prompt, cancel_rx) = self.begin_query(message);
        let started = Instant::now();
        info!(
            backend = self.kind(),
            user,
            chars = message.len(),
            "sending message"
        );

        let mut sub = session.subscribe();
        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);

        let outcome = tokio::select! {
            outcome = self.drive(session.as_ref(), &mut sub, &prompt, &updates) => outcome,
            Ok(()) = cancel_rx => Outcome::Killed,
            _ = &mut deadline => Outcome::TimedOut,
        };
        sub.release();

        self.settle(outcome, session.as_ref(), user, started).await
    }

    async fn ensure_session(&self) -> Result<Arc<dyn BackendSession>> {
        if let Some(handle) = self.state().handle.clone() {
            return Ok(handle);
        }

        let _opening = self.open_lock.lock().await;
        if let Some(handle) = self.state().handle.clone() {
            return Ok(handle);
        }

        let (env, account) = match &self.pool {
            Some(pool) if self.backend.uses_account_pool() => {
                (pool.current_env(), pool.current().map(|a| a.name))
            }
            _ => (EnvOverrides::new(), None),
        };

        let session = match self.backend.open_session(env).await {
            Ok(session) => session,
            Err(e) => {
                let message = e.to_string();
                self.state().record_error(&message);
                warn!(backend = self.kind(), error = %message, "failed to open agent session");
                return Err(EngineError::Initialization(message));
            }
        };

        let session_id = session.session_id();
        {
            let mut state = self.state();
            state.handle = Some(session.clone());
            state.session_id = Some(session_id.clone());
            state.model = session.model();
            state.needs_context = true;
        }
        info!(
            backend = self.kind(),
            session_id = %session_id,
            account = account.as_deref().unwrap_or("-"),
            "agent session opened"
        );
        Ok(session)
    }

    fn begin_query(&self, message: &str) -> (String, oneshot::Receiver<()>) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let mut state = self.state();
        state.processing = true;
        state.stop_requested = false;
        state.query_started = Some(Utc::now());
        state.current_tool = None;
        state.last_message = Some(message.to_string());
        state.cancel = Some(cancel_tx);

        let prompt = if std::mem::take(&mut state.needs_context) {
            with_date_context(message, Local::now().into())
        } else {
            message.to_string()
        };
        (prompt, cancel_rx)
    }

    async fn drive(
        &self,
        session: &dyn BackendSession,
        sub: &mut Subscription,
        prompt: &str,
        updates: &StatusSender,
    ) -> Outcome {
        if let Err(e) = session.send(prompt).await {
            return Outcome::Failed(e);
        }

        let mut segmenter = Segmenter::new(self.config.throttle);
        while let Some(event) = sub.recv().await {
            match event {
                BackendEvent::MessageDelta { content } => {
                    forward(updates, segmenter.on_delta(&content, Instant::now()));
                }
                BackendEvent::Message { content } => {
                    forward(updates, segmenter.on_message(&content, Instant::now()));
                }
                BackendEvent::Reasoning { content } => {
                    forward(updates, Some(StatusUpdate::thinking(content)));
                }
                BackendEvent::ToolStart { name } => {
                    forward(updates, segmenter.on_tool_start());
                    {
                        let mut state = self.state();
                        state.current_tool = Some(name.clone());
                        state.last_tool = Some(name.clone());
                    }
                    debug!(backend = self.kind(), tool = %name, "tool started");
                    forward(updates, Some(StatusUpdate::tool(name)));
                }
                BackendEvent::ToolComplete { name } => {
                    let mut state = self.state();
                    if state.current_tool.as_deref() == Some(name.as_str()) {
                        state.current_tool = None;
                    }
                }
                BackendEvent::Usage(usage) => self.state().last_usage = Some(usage),
                BackendEvent::TitleChanged { title } => {
                    self.state().conversation_title = Some(title);
                }
                BackendEvent::ModelChanged { model } => self.state().model = Some(model),
                BackendEvent::Idle => {
                    forward(updates, segmenter.finish());
                    forward(updates, Some(StatusUpdate::done()));
                    return Outcome::Completed(segmenter.into_full_text());
                }
                BackendEvent::Error(e) => return Outcome::Failed(e),
            }
        }

        Outcome::Failed(agent_backend::Error::Closed(
            "event stream ended before the turn completed".into(),
        ))
    }

    async fn settle(
        &self,
        outcome: Outcome,
        session: &dyn BackendSession,
        user: &str,
        started: Instant,
    ) -> Result<String> {
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Outcome::Completed(text) => {
                {
                    let mut state = self.state();
                    state.end_query();
                    state.last_activity = Some(Utc::now());
                    state.last_error = None;
                    state.last_error_time = None;
                }
                info!(
                    backend = self.kind(),
                    user,
                    elapsed_ms,
                    chars = text.len(),
                    "response complete"
                );
                if text.trim().is_empty() {
                    Ok(FALLBACK_RESPONSE.to_string())
                } else {
                    Ok(text)
                }
            }
            Outcome::Failed(err) => {
                let kind = err.kind();
                let message = err.to_string();
                let cancelled = {
                    let mut state = self.state();
                    let cancelled = (kind == ErrorKind::Aborted
                        && (state.stop_requested || state.interrupt_flag))
                        .then_some(state.interrupt_flag);
                    if cancelled.is_none() {
                        state.record_error(&message);
                    }
                    state.end_query();
                    cancelled
                };

                if let Some(interrupted) = cancelled {
                    info!(backend = self.kind(), user, interrupted, "query cancelled");
                    return Err(EngineError::Cancelled { interrupted });
                }
                warn!(
                    backend = self.kind(),
                    user,
                    elapsed_ms,
                    kind = kind.label(),
                    error = %message,
                    "agent turn failed"
                );
                Err(EngineError::Session { kind, message })
            }
            Outcome::TimedOut => {
                let timeout = self.config.timeout;
                {
                    let mut state = self.state();
                    state.record_error(&format!("timed out after {}s", timeout.as_secs()));
                    state.end_query();
                }
                warn!(
                    backend = self.kind(),
                    user,
                    timeout_secs = timeout.as_secs(),
                    "agent turn timed out"
                );
                if let Err(e) = session.abort().await {
                    debug!(backend = self.kind(), error = %e, "abort after timeout failed");
                }
                Err(EngineError::Timeout(timeout))
            }
            Outcome::Killed => {
                let interrupted = {
                    let mut state = self.state();
                    state.end_query();
                    state.interrupt_flag
                };
                info!(backend = self.kind(), user, "query ended by session kill");
                Err(EngineError::Cancelled { interrupted })
            }
        }
    }

    /// Abort the running send.
    pub async fn stop(&self) -> StopOutcome {
        let handle = {
            let mut state = self.state();
            if state.query_started.is_none() {
                return StopOutcome::NotRunning;
            }
            let Some(handle) = state.handle.clone() else {
                return StopOutcome::NotRunning;
            };
            state.stop_requested = true;
            handle
        };

        match handle.abort().await {
            Ok(()) => {
                info!(backend = self.kind(), "stop requested");
                StopOutcome::Stopped
            }
            Err(e) => {
                warn!(backend = self.kind(), error = %e, "abort failed, stop pending");
                StopOutcome::Pending
            }
        }
    }

    /// Destroy the backend session and reset per-session state. Any send in
    /// flight settles as cancelled.
    pub async fn kill(&self) {
        let (handle, cancel) = {
            let mut state = self.state();
            let handle = state.handle.take();
            let cancel = state.cancel.take();
            state.reset_session();
            (handle, cancel)
        };

        if let Some(cancel) = cancel {
            let _ = cancel.send(());
        }
        if let Some(handle) = handle {
            let session_id = handle.session_id();
            handle.destroy().await;
            info!(backend = self.kind(), session_id = %session_id, "agent session killed");
        }
    }

    pub fn start_processing(&self) -> ProcessingGuard {
        self.state().processing = true;
        let state = Arc::clone(&self.state);
        ProcessingGuard::new(move || lock_state(&state).processing = false)
    }

    pub fn is_processing(&self) -> bool {
        self.state().processing
    }

    pub fn clear_stop_requested(&self) {
        self.state().stop_requested = false;
    }

    pub fn mark_interrupt(&self) {
        self.state().interrupt_flag = true;
    }

    pub fn consume_interrupt_flag(&self) -> bool {
        std::mem::take(&mut self.state().interrupt_flag)
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state();
        let now = Utc::now();
        SessionInfo {
            backend: self.kind().to_string(),
            active: state.handle.is_some(),
            session_id: state.session_id.clone(),
            model: state.model.clone(),
            processing: state.processing,
            stop_requested: state.stop_requested,
            query_started: state.query_started,
            query_elapsed_secs: state
                .query_started
                .map(|t| (now - t).num_seconds().max(0) as u64),
            last_activity: state.last_activity,
            current_tool: state.current_tool.clone(),
            last_tool: state.last_tool.clone(),
            last_error: state.last_error.clone(),
            last_error_time: state.last_error_time,
            last_usage: state.last_usage,
            last_message: state.last_message.clone(),
            conversation_title: state.conversation_title.clone(),
        }
    }
}

impl AgentSession for SessionEngine {
    fn kind(&self) -> &str {
        self.backend.kind()
    }

    fn uses_account_pool(&self) -> bool {
        SessionEngine::uses_account_pool(self)
    }

    fn send_message_streaming<'a>(
        &'a self,
        message: &'a str,
        user: &'a str,
        updates: StatusSender,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(SessionEngine::send_message_streaming(
            self, message, user, updates,
        ))
    }

    fn stop(&self) -> BoxFuture<'_, StopOutcome> {
        Box::pin(SessionEngine::stop(self))
    }

    fn kill(&self) -> BoxFuture<'_, ()> {
        Box::pin(SessionEngine::kill(self))
    }

    fn start_processing(&self) -> ProcessingGuard {
        SessionEngine::start_processing(self)
    }

    fn is_processing(&self) -> bool {
        SessionEngine::is_processing(self)
    }

    fn clear_stop_requested(&self) {
        SessionEngine::clear_stop_requested(self)
    }

    fn mark_interrupt(&self) {
        SessionEngine::mark_interrupt(self)
    }

    fn consume_interrupt_flag(&self) -> bool {
        SessionEngine::consume_interrupt_flag(self)
    }

    fn info(&self) -> SessionInfo {
        SessionEngine::info(self)
    }
}

fn lock_state(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn forward(updates: &StatusSender, update: Option<StatusUpdate>) {
    // Receiver gone means the caller stopped listening; the turn still settles
    if let Some(update) = update {
        let _ = updates.send(update);
    }
}

fn with_date_context(message: &str, now: DateTime<FixedOffset>) -> String {
    format!(
        "[Current date and time: {}]\n\n{message}",
        now.format("%A, %B %-d, %Y %H:%M %:z")
    )
}
