//! Account ring and rate-limit rotation
//!
//! The pool keeps accounts in discovery order with a `current` index. A rate
//! limit puts the current account into cooldown and scans the ring once,
//! starting after it, for the first account whose cooldown is unset or over.
//! Cooldowns expire passively: an account is eligible again as soon as its
//! `rate_limited_until` is in the past.
//!
//! All state lives behind one `std::sync::Mutex`. Rotation never suspends, so
//! concurrent callers apply one after another.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::discovery::{AccountSources, resolve_names, sanitize_name};
use crate::error::Result;

/// Default environment variable that points an agent at its credential
/// directory.
pub const DEFAULT_ENV_VAR: &str = "CLAUDE_CONFIG_DIR";

/// Static pool configuration.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Pool root; account directories live in `<root>/instances/`.
    pub root: PathBuf,
    /// Variable set to the current account's directory.
    pub env_var: String,
    /// Cooldown applied when a rotation call doesn't pass its own.
    pub cooldown: Duration,
    pub sources: AccountSources,
}

#[derive(Debug, Clone)]
struct Account {
    name: String,
    credential_dir: PathBuf,
    rate_limited_until: Option<Instant>,
}

impl Account {
    fn is_eligible(&self, now: Instant) -> bool {
        match self.rate_limited_until {
            None => true,
            Some(until) => now >= until,
        }
    }

    fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.rate_limited_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }
}

struct PoolState {
    accounts: Vec<Account>,
    current: usize,
}

/// Point-in-time view of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountSnapshot {
    pub name: String,
    pub credential_dir: PathBuf,
    pub current: bool,
    /// Whole seconds of cooldown left, if limited.
    pub cooldown_remaining_secs: Option<u64>,
}

/// Rotating pool of credential profiles.
pub struct AccountPool {
    env_var: String,
    cooldown: Duration,
    state: Mutex<PoolState>,
}

impl AccountPool {
    /// Discover account names and admit those whose instance directory exists.
    pub async fn load(settings: PoolSettings) -> Result<Self> {
        let names = resolve_names(&settings.sources).await?;
        Ok(Self::from_names(settings, names).await)
    }

    /// Build a pool from already-resolved names, validating each against disk.
    pub async fn from_names(settings: PoolSettings, names: Vec<String>) -> Self {
        let instances = settings.root.join("instances");
        let mut accounts = Vec::with_capacity(names.len());

        for name in names {
            let dir = instances.join(sanitize_name(&name));
            match tokio::fs::metadata(&dir).await {
                Ok(meta) if meta.is_dir() => accounts.push(Account {
                    name,
                    credential_dir: dir,
                    rate_limited_until: None,
                }),
                _ => warn!(
                    account = %name,
                    dir = %dir.display(),
                    "account instance directory missing, skipping"
                ),
            }
        }

        info!(
            accounts = accounts.len(),
            root = %settings.root.display(),
            "account pool initialized"
        );

        Self {
            env_var: settings.env_var,
            cooldown: settings.cooldown,
            state: Mutex::new(PoolState {
                accounts,
                current: 0,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.state().accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the current account. Meaningless when the pool is empty.
    pub fn current_index(&self) -> usize {
        self.state().current
    }

    /// Environment overrides for the current account.
    ///
    /// Empty when the pool has no accounts: the agent then runs under
    /// whatever credentials the process already has.
    pub fn current_env(&self) -> HashMap<String, String> {
        let state = self.state();
        let mut env = HashMap::new();
        if let Some(account) = state.accounts.get(state.current) {
            env.insert(
                self.env_var.clone(),
                account.credential_dir.display().to_string(),
            );
        }
        env
    }

    /// The current account, if any.
    pub fn current(&self) -> Option<AccountSnapshot> {
        let state = self.state();
        let now = Instant::now();
        state
            .accounts
            .get(state.current)
            .map(|a| snapshot(a, true, now))
    }

    /// Put the current account into cooldown and move to the next eligible one.
    ///
    /// Scans exactly `len` positions starting after the current account,
    /// wrapping around. Returns false, leaving the current index on the
    /// account just limited, when no account is eligible: the provider is
    /// exhausted and the caller should not retry.
    pub fn mark_limited_and_rotate(&self, cooldown: Option<Duration>) -> bool {
        let mut state = self.state();
        let n = state.accounts.len();
        if n == 0 {
            return false;
        }

        let now = Instant::now();
        let cooldown = cooldown.unwrap_or(self.cooldown);
        let current = state.current;
        state.accounts[current].rate_limited_until = Some(now + cooldown);
        info!(
            account = %state.accounts[current].name,
            cooldown_secs = cooldown.as_secs(),
            "account rate limited"
        );

        for step in 1..=n {
            let idx = (current + step) % n;
            if state.accounts[idx].is_eligible(now) {
                state.current = idx;
                info!(
                    from = %state.accounts[current].name,
                    to = %state.accounts[idx].name,
                    "rotated to account"
                );
                return true;
            }
        }

        warn!(accounts = n, "all accounts rate limited");
        false
    }

    /// One line per account: `*` marks the current account, limited accounts
    /// show their remaining cooldown in whole seconds.
    pub fn status(&self) -> String {
        let snapshots = self.snapshot();
        if snapshots.is_empty() {
            return "no accounts configured".to_string();
        }
        snapshots
            .iter()
            .map(|a| {
                let marker = if a.current { '*' } else { ' ' };
                match a.cooldown_remaining_secs {
                    Some(secs) => format!("{marker} {} (rate limited, {secs}s left)", a.name),
                    None => format!("{marker} {}", a.name),
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// All accounts in ring order.
    pub fn snapshot(&self) -> Vec<AccountSnapshot> {
        let state = self.state();
        let now = Instant::now();
        state
            .accounts
            .iter()
            .enumerate()
            .map(|(i, a)| snapshot(a, i == state.current, now))
            .collect()
    }

    /// Pool health summary for the health endpoint.
    ///
    /// Status mapping: all eligible → healthy, some eligible → degraded,
    /// none eligible (or no accounts) → unhealthy.
    pub fn health(&self) -> serde_json::Value {
        let accounts = self.snapshot();
        let total = accounts.len();
        let limited = accounts
            .iter()
            .filter(|a| a.cooldown_remaining_secs.is_some())
            .count();
        let available = total - limited;

        let status = if total > 0 && available == total {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "accounts_total": total,
            "accounts_available": available,
            "accounts_rate_limited": limited,
            "accounts": accounts,
        })
    }
}

fn snapshot(account: &Account, current: bool, now: Instant) -> AccountSnapshot {
    AccountSnapshot {
        name: account.name.clone(),
        credential_dir: account.credential_dir.clone(),
        current,
        cooldown_remaining_secs: account
            .cooldown_remaining(now)
            .map(|d| d.as_secs_f64().ceil() as u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Create `<root>/instances/<id>` for each name and load a pool over them.
    async fn test_pool(dir: &tempfile::TempDir, names: &[&str]) -> AccountPool {
        for name in names {
            std::fs::create_dir_all(dir.path().join("instances").join(sanitize_name(name)))
                .unwrap();
        }
        AccountPool::from_names(
            settings(dir),
            names.iter().map(|n| n.to_string()).collect(),
        )
        .await
    }

    fn settings(dir: &tempfile::TempDir) -> PoolSettings {
        PoolSettings {
            root: dir.path().to_path_buf(),
            env_var: DEFAULT_ENV_VAR.into(),
            cooldown: Duration::from_secs(3600),
            sources: AccountSources::default(),
        }
    }

    fn limit(pool: &AccountPool, idx: usize, for_secs: u64) {
        pool.state().accounts[idx].rate_limited_until =
            Some(Instant::now() + Duration::from_secs(for_secs));
    }

    fn current_name(pool: &AccountPool) -> String {
        pool.current().unwrap().name
    }

    #[tokio::test]
    async fn admits_only_accounts_with_instance_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("instances").join("work")).unwrap();

        let pool = AccountPool::from_names(
            settings(&dir),
            vec!["Work".into(), "ghost".into()],
        )
        .await;

        assert_eq!(pool.len(), 1);
        assert_eq!(current_name(&pool), "Work");
    }

    #[tokio::test]
    async fn current_env_points_at_instance_dir() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["My Account"]).await;

        let env = pool.current_env();
        let expected = dir.path().join("instances").join("my-account");
        assert_eq!(env.len(), 1);
        assert_eq!(env[DEFAULT_ENV_VAR], expected.display().to_string());
    }

    #[tokio::test]
    async fn empty_pool_degrades_to_no_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &[]).await;

        assert!(pool.is_empty());
        assert!(pool.current_env().is_empty());
        assert!(pool.current().is_none());
        assert!(!pool.mark_limited_and_rotate(None));
        assert_eq!(pool.status(), "no accounts configured");
        assert_eq!(pool.health()["status"], "unhealthy");
    }

    #[tokio::test]
    async fn rotates_past_limited_account() {
        // [A(limited for 10s), B(ok), C(ok)], current = A
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["a", "b", "c"]).await;
        limit(&pool, 0, 10);

        assert!(pool.mark_limited_and_rotate(None));
        assert_eq!(current_name(&pool), "b");
    }

    #[tokio::test]
    async fn single_account_exhausts() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["a"]).await;

        assert!(!pool.mark_limited_and_rotate(None));
        assert_eq!(pool.current_index(), 0);
        assert!(pool.snapshot()[0].cooldown_remaining_secs.is_some());
    }

    #[tokio::test]
    async fn all_limited_leaves_index_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["a", "b", "c", "d"]).await;
        pool.state().current = 2;
        for idx in 0..4 {
            limit(&pool, idx, 60);
        }

        assert!(!pool.mark_limited_and_rotate(None));
        assert_eq!(pool.current_index(), 2);
    }

    #[tokio::test]
    async fn selects_nearest_eligible_clockwise_with_wrap() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["a", "b", "c", "d"]).await;
        pool.state().current = 2;
        limit(&pool, 3, 60);
        limit(&pool, 0, 60);

        assert!(pool.mark_limited_and_rotate(None));
        assert_eq!(current_name(&pool), "b");
    }

    #[tokio::test]
    async fn expired_cooldown_is_eligible_again() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["a", "b"]).await;
        pool.state().accounts[1].rate_limited_until =
            Some(Instant::now() - Duration::from_secs(1));

        assert!(pool.mark_limited_and_rotate(None));
        assert_eq!(current_name(&pool), "b");
    }

    #[tokio::test]
    async fn zero_cooldown_can_rotate_back_to_self() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["a"]).await;

        // A zero cooldown expires immediately, so the full scan lands back on "a"
        assert!(pool.mark_limited_and_rotate(Some(Duration::ZERO)));
        assert_eq!(pool.current_index(), 0);
    }

    #[tokio::test]
    async fn explicit_cooldown_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["a", "b"]).await;

        pool.mark_limited_and_rotate(Some(Duration::from_secs(30)));
        let remaining = pool.snapshot()[0].cooldown_remaining_secs.unwrap();
        assert!(remaining <= 30 && remaining > 0, "got {remaining}");
    }

    #[tokio::test]
    async fn status_marks_current_and_cooldowns() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["a", "b"]).await;
        pool.mark_limited_and_rotate(Some(Duration::from_secs(42)));

        let status = pool.status();
        let lines: Vec<&str> = status.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("  a (rate limited, "), "got: {}", lines[0]);
        assert!(lines[0].ends_with("s left)"), "got: {}", lines[0]);
        assert_eq!(lines[1], "* b");
    }

    #[tokio::test]
    async fn health_reports_degraded_when_some_limited() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["a", "b"]).await;
        assert_eq!(pool.health()["status"], "healthy");

        pool.mark_limited_and_rotate(None);
        let health = pool.health();
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["accounts_rate_limited"], 1);
        assert_eq!(health["accounts"][1]["current"], true);
    }

    #[tokio::test]
    async fn load_resolves_sources_then_validates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("instances").join("work")).unwrap();
        let accounts_file = dir.path().join("config.yaml");
        std::fs::write(&accounts_file, "accounts:\n  work:\n  missing:\n").unwrap();

        let mut settings = settings(&dir);
        settings.sources.accounts_file = Some(accounts_file);
        let pool = AccountPool::load(settings).await.unwrap();

        assert_eq!(pool.len(), 1);
        assert_eq!(current_name(&pool), "work");
    }
}
