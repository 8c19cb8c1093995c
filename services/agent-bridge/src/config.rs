//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! `AGENT_BRIDGE_ACCOUNTS` replaces `pool.accounts` so the account list can be
//! changed per deployment without editing the file.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use account_pool::{AccountSources, PoolSettings, pool::DEFAULT_ENV_VAR};
use agent_backend::ProcessBackendConfig;
use serde::Deserialize;
use session_engine::{EngineConfig, ThrottleConfig};

/// Environment variable holding a comma-separated account list.
pub const ACCOUNTS_ENV: &str = "AGENT_BRIDGE_ACCOUNTS";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Backend kind for users without a stored preference. Defaults to the
    /// first configured backend.
    #[serde(default)]
    pub default_backend: Option<String>,
    /// Where per-user backend preferences are persisted.
    #[serde(default)]
    pub preferences_file: Option<PathBuf>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

/// Account pool settings. The pool is disabled when `root` is unset.
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Comma-separated account names.
    #[serde(default)]
    pub accounts: Option<String>,
    /// File with an `accounts:` section.
    #[serde(default)]
    pub accounts_file: Option<PathBuf>,
    /// JSON file listing account names.
    #[serde(default)]
    pub fallback_file: Option<PathBuf>,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_env_var")]
    pub env_var: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            root: None,
            accounts: None,
            accounts_file: None,
            fallback_file: None,
            cooldown_secs: default_cooldown(),
            env_var: default_env_var(),
        }
    }
}

/// Session engine tuning
#[derive(Debug, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            throttle_ms: default_throttle_ms(),
            min_chars: default_min_chars(),
        }
    }
}

/// One agent backend
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub kind: String,
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Run this backend under the account pool's credentials.
    #[serde(default)]
    pub use_pool: bool,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
}

impl BackendConfig {
    pub fn process_config(&self) -> ProcessBackendConfig {
        ProcessBackendConfig {
            kind: self.kind.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            working_dir: self.working_dir.clone(),
            use_account_pool: self.use_pool,
            startup_timeout: Duration::from_secs(self.startup_timeout_secs),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_max_connections() -> usize {
    100
}

fn default_cooldown() -> u64 {
    3600
}

fn default_env_var() -> String {
    DEFAULT_ENV_VAR.to_string()
}

fn default_timeout() -> u64 {
    300
}

fn default_throttle_ms() -> u64 {
    500
}

fn default_min_chars() -> usize {
    20
}

fn default_startup_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;

        if let Ok(accounts) = std::env::var(ACCOUNTS_ENV)
            && !accounts.trim().is_empty()
        {
            config.pool.accounts = Some(accounts);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.engine.timeout_secs == 0 {
            return Err(common::Error::Config(
                "engine.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.engine.throttle_ms == 0 {
            return Err(common::Error::Config(
                "engine.throttle_ms must be greater than 0".into(),
            ));
        }
        if self.pool.cooldown_secs == 0 {
            return Err(common::Error::Config(
                "pool.cooldown_secs must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "server.max_connections must be greater than 0".into(),
            ));
        }
        if self.backends.is_empty() {
            return Err(common::Error::Config(
                "at least one [[backends]] entry is required".into(),
            ));
        }

        let mut kinds = HashSet::new();
        for backend in &self.backends {
            if backend.kind.trim().is_empty() {
                return Err(common::Error::Config("backend kind must not be empty".into()));
            }
            if !kinds.insert(backend.kind.as_str()) {
                return Err(common::Error::Config(format!(
                    "duplicate backend kind: {}",
                    backend.kind
                )));
            }
        }

        if let Some(default) = &self.default_backend
            && !kinds.contains(default.as_str())
        {
            return Err(common::Error::Config(format!(
                "default_backend {default} does not name a configured backend"
            )));
        }

        if self.pool.root.is_none() && self.backends.iter().any(|b| b.use_pool) {
            return Err(common::Error::Config(
                "pool.root is required when a backend sets use_pool".into(),
            ));
        }

        Ok(())
    }

    /// Backend kind for users without a preference.
    pub fn default_backend(&self) -> &str {
        match &self.default_backend {
            Some(kind) => kind,
            None => self.backends.first().map(|b| b.kind.as_str()).unwrap_or_default(),
        }
    }

    /// Pool settings, or `None` when no pool root is configured.
    pub fn pool_settings(&self) -> Option<PoolSettings> {
        let root = self.pool.root.clone()?;
        Some(PoolSettings {
            root,
            env_var: self.pool.env_var.clone(),
            cooldown: Duration::from_secs(self.pool.cooldown_secs),
            sources: AccountSources {
                explicit: self.pool.accounts.clone(),
                accounts_file: self.pool.accounts_file.clone(),
                fallback_file: self.pool.fallback_file.clone(),
            },
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            timeout: Duration::from_secs(self.engine.timeout_secs),
            throttle: ThrottleConfig {
                interval: Duration::from_millis(self.engine.throttle_ms),
                min_chars: self.engine.min_chars,
            },
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("agent-bridge.toml")
    }
}
