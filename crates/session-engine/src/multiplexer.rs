//! Per-user routing across backend engines
//!
//! Each user has a preferred backend kind, falling back to the global default.
//! Every operation is forwarded to the engine for that kind; engines are shared
//! by all users routed to them, the multiplexer itself keeps no session data.
//!
//! Preferences can be persisted to a JSON object `{ "<user>": "<kind>" }`,
//! rewritten atomically on every change.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::error::{MultiplexError, Result};
use crate::status::SessionInfo;
use crate::{AgentSession, ProcessingGuard, StatusSender, StopOutcome};

pub struct Multiplexer {
    engines: BTreeMap<String, Arc<dyn AgentSession>>,
    default_kind: String,
    default_engine: Arc<dyn AgentSession>,
    preferences: RwLock<HashMap<String, String>>,
    preferences_file: Option<PathBuf>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl Multiplexer {
    /// Build a multiplexer over one engine per backend kind.
    pub fn new(
        default_kind: &str,
        engines: Vec<Arc<dyn AgentSession>>,
    ) -> std::result::Result<Self, MultiplexError> {
        let mut by_kind = BTreeMap::new();
        for engine in engines {
            let kind = engine.kind().to_string();
            if by_kind.insert(kind.clone(), engine).is_some() {
                return Err(MultiplexError::DuplicateBackend(kind));
            }
        }
        let default_engine = by_kind
            .get(default_kind)
            .cloned()
            .ok_or_else(|| MultiplexError::MissingDefault(default_kind.to_string()))?;

        Ok(Self {
            engines: by_kind,
            default_kind: default_kind.to_string(),
            default_engine,
            preferences: RwLock::new(HashMap::new()),
            preferences_file: None,
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Load preferences from `path` and persist future changes there.
    ///
    /// A missing file starts empty. Entries naming a backend that is no longer
    /// configured are dropped.
    pub async fn with_preferences_file(
        mut self,
        path: PathBuf,
    ) -> std::result::Result<Self, MultiplexError> {
        let loaded: HashMap<String, String> = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents).map_err(common::Error::from)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(common::Error::from(e).into()),
        };

        let mut preferences = HashMap::with_capacity(loaded.len());
        for (user, kind) in loaded {
            if self.engines.contains_key(&kind) {
                preferences.insert(user, kind);
            } else {
                warn!(user = %user, backend = %kind, "dropping preference for unknown backend");
            }
        }
        info!(
            path = %path.display(),
            users = preferences.len(),
            "loaded backend preferences"
        );

        self.preferences = RwLock::new(preferences);
        self.preferences_file = Some(path);
        Ok(self)
    }

    pub fn default_kind(&self) -> &str {
        &self.default_kind
    }

    /// Configured backend kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        self.engines.keys().cloned().collect()
    }

    /// Every engine, sorted by kind.
    pub fn engines(&self) -> impl Iterator<Item = &Arc<dyn AgentSession>> {
        self.engines.values()
    }

    pub fn engine(&self, kind: &str) -> Option<Arc<dyn AgentSession>> {
        self.engines.get(kind).cloned()
    }

    pub fn uses_account_pool(&self, kind: &str) -> bool {
        self.engines
            .get(kind)
            .is_some_and(|engine| engine.uses_account_pool())
    }

    /// Backend kind `user` is routed to.
    pub fn backend_for(&self, user: &str) -> String {
        self.preferences
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user)
            .filter(|kind| self.engines.contains_key(kind.as_str()))
            .cloned()
            .unwrap_or_else(|| self.default_kind.clone())
    }

    /// Engine `user` is routed to.
    pub fn engine_for(&self, user: &str) -> Arc<dyn AgentSession> {
        let kind = self.backend_for(user);
        self.engines
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| self.default_engine.clone())
    }

    /// Route `user` to `kind` and persist the change.
    pub async fn set_backend(&self, user: &str, kind: &str) -> std::result::Result<(), MultiplexError> {
        if !self.engines.contains_key(kind) {
            return Err(MultiplexError::UnknownBackend(kind.to_string()));
        }

        let _persisting = self.persist_lock.lock().await;
        let snapshot = {
            let mut prefs = self.preferences.write().unwrap_or_else(|e| e.into_inner());
            prefs.insert(user.to_string(), kind.to_string());
            prefs.clone()
        };
        info!(user, backend = kind, "backend preference set");

        if let Some(path) = &self.preferences_file {
            let sorted: BTreeMap<_, _> = snapshot.into_iter().collect();
            let json = serde_json::to_vec_pretty(&sorted).map_err(common::Error::from)?;
            common::write_atomic(path, &json).await?;
        }
        Ok(())
    }

    pub async fn send_message_streaming(
        &self,
        user: &str,
        message: &str,
        updates: StatusSender,
    ) -> Result<String> {
        self.engine_for(user)
            .send_message_streaming(message, user, updates)
            .await
    }

    pub async fn stop(&self, user: &str) -> StopOutcome {
        self.engine_for(user).stop().await
    }

    pub async fn kill(&self, user: &str) {
        self.engine_for(user).kill().await
    }

    pub fn start_processing(&self, user: &str) -> ProcessingGuard {
        self.engine_for(user).start_processing()
    }

    pub fn is_processing(&self, user: &str) -> bool {
        self.engine_for(user).is_processing()
    }

    pub fn clear_stop_requested(&self, user: &str) {
        self.engine_for(user).clear_stop_requested()
    }

    pub fn mark_interrupt(&self, user: &str) {
        self.engine_for(user).mark_interrupt()
    }

    pub fn consume_interrupt_flag(&self, user: &str) -> bool {
        self.engine_for(user).consume_interrupt_flag()
    }

    pub fn info(&self, user: &str) -> SessionInfo {
        self.engine_for(user).info()
    }

    /// Kill every engine's session.
    pub async fn shutdown(&self) {
        for engine in self.engines.values() {
            engine.kill().await;
        }
        info!(engines = self.engines.len(), "all agent sessions shut down");
    }
}
