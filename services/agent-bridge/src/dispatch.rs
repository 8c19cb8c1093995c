//! Send dispatch with crash and rate-limit recovery
//!
//! Recovery policy per failed turn:
//! - Crashed: kill the session and retry once on a fresh one
//! - RateLimited on a pool-backed backend: cool the account down and rotate,
//!   then retry on the next account. A send tries each account at most once
//!   and fails with `AllAccountsLimited` once the ring is exhausted.
//! - Cancelled: surfaced as-is
//!
//! The interrupt flag is consumed whenever a send settles.
//!
//! Admission is per backend kind: engines are shared by every user routed to
//! them, so only one send may run on an engine at a time. The permit pins the
//! engine, so a preference change mid-send does not move the retries.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use account_pool::AccountPool;
use session_engine::{
    AgentSession, EngineError, Multiplexer, ProcessingGuard, StatusSender, StopOutcome,
};
use tracing::{info, warn};

use crate::metrics;

/// Held for the duration of one send. Releases the engine on drop.
pub struct SendPermit {
    kind: String,
    engine: Arc<dyn AgentSession>,
    busy: Arc<Mutex<HashSet<String>>>,
    _processing: ProcessingGuard,
}

impl SendPermit {
    pub fn kind(&self) -> &str {
        &self.kind
    }
}

impl Drop for SendPermit {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.kind);
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    mux: Arc<Multiplexer>,
    pool: Option<Arc<AccountPool>>,
    busy: Arc<Mutex<HashSet<String>>>,
}

impl Dispatcher {
    pub fn new(mux: Arc<Multiplexer>, pool: Option<Arc<AccountPool>>) -> Self {
        Self {
            mux,
            pool,
            busy: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn mux(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn pool(&self) -> Option<&AccountPool> {
        self.pool.as_deref()
    }

    /// Claim the engine `user` is routed to. `None` while another send runs on it.
    pub fn try_begin(&self, user: &str) -> Option<SendPermit> {
        let engine = self.mux.engine_for(user);
        let kind = engine.kind().to_string();
        let mut busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        if !busy.insert(kind.clone()) {
            return None;
        }
        Some(SendPermit {
            kind,
            _processing: engine.start_processing(),
            engine,
            busy: self.busy.clone(),
        })
    }

    /// Send `message` for `user` on the permit's engine, recovering from
    /// crashes and rate limits.
    pub async fn send(
        &self,
        permit: &SendPermit,
        user: &str,
        message: &str,
        updates: StatusSender,
    ) -> Result<String, EngineError> {
        let engine = &permit.engine;
        let kind = permit.kind();
        let started = Instant::now();
        engine.clear_stop_requested();

        let mut crash_retried = false;
        let mut limited = 0usize;
        let result = loop {
            match engine
                .send_message_streaming(message, user, updates.clone())
                .await
            {
                Err(e) if e.is_crash() && !crash_retried => {
                    crash_retried = true;
                    warn!(user, backend = kind, error = %e, "agent crashed, retrying on a fresh session");
                    engine.kill().await;
                }
                Err(e) if e.is_rate_limit() && engine.uses_account_pool() => {
                    let Some(pool) = &self.pool else {
                        break Err(e);
                    };
                    let rotated = pool.mark_limited_and_rotate(None);
                    metrics::record_rotation(rotated);
                    limited += 1;
                    if !rotated || limited >= pool.len() {
                        warn!(user, backend = kind, attempts = limited, "every account rate limited");
                        break Err(EngineError::AllAccountsLimited);
                    }
                    info!(
                        user,
                        backend = kind,
                        account = pool.current().map(|a| a.name).as_deref().unwrap_or("-"),
                        "rate limited, retrying on next account"
                    );
                    engine.kill().await;
                }
                other => break other,
            }
        };

        engine.consume_interrupt_flag();

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        metrics::record_send(kind, outcome, started.elapsed().as_secs_f64());
        result
    }

    /// Abort the running send because a newer message supersedes it.
    pub async fn interrupt(&self, user: &str) -> StopOutcome {
        self.mux.mark_interrupt(user);
        let outcome = self.mux.stop(user).await;
        if !outcome.was_running() {
            self.mux.consume_interrupt_flag(user);
        }
        outcome
    }

    pub async fn stop(&self, user: &str) -> StopOutcome {
        self.mux.stop(user).await
    }
}
