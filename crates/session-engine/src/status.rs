//! Session diagnostics
//!
//! `SessionInfo` is the engine's raw snapshot. `StatusReport` combines it with
//! the user's routing and the account pool into one view that can be served as
//! JSON or rendered as text for a chat reply.

use account_pool::{AccountPool, AccountSnapshot};
use agent_backend::Usage;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::multiplexer::Multiplexer;

/// Point-in-time view of one engine's session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub backend: String,
    /// Whether a backend session is open.
    pub active: bool,
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub processing: bool,
    pub stop_requested: bool,
    pub query_started: Option<DateTime<Utc>>,
    pub query_elapsed_secs: Option<u64>,
    pub last_activity: Option<DateTime<Utc>>,
    pub current_tool: Option<String>,
    pub last_tool: Option<String>,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub last_usage: Option<Usage>,
    pub last_message: Option<String>,
    pub conversation_title: Option<String>,
}

/// Everything a user's `/status` shows.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub user: String,
    pub backend: String,
    pub available_backends: Vec<String>,
    pub session: SessionInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountSnapshot>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<AccountSnapshot>,
    pub generated_at: DateTime<Utc>,
}

impl StatusReport {
    /// Collect the report for `user`. Pool details are included only when the
    /// user's backend runs under the pool.
    pub fn collect(mux: &Multiplexer, pool: Option<&AccountPool>, user: &str) -> Self {
        let backend = mux.backend_for(user);
        let session = mux.info(user);
        let (account, accounts) = match pool {
            Some(pool) if mux.uses_account_pool(&backend) => (pool.current(), pool.snapshot()),
            _ => (None, Vec::new()),
        };

        Self {
            user: user.to_string(),
            backend,
            available_backends: mux.kinds(),
            session,
            account,
            accounts,
            generated_at: Utc::now(),
        }
    }

    /// Multi-line human-readable rendering.
    pub fn render(&self) -> String {
        let now = self.generated_at;
        let s = &self.session;
        let mut lines = Vec::new();

        lines.push(format!("Backend: {}", self.backend));

        match (&s.session_id, s.active) {
            (Some(id), true) => match &s.model {
                Some(model) => lines.push(format!("Session: {id} ({model})")),
                None => lines.push(format!("Session: {id}")),
            },
            _ => lines.push("Session: none".to_string()),
        }

        if let Some(title) = &s.conversation_title {
            lines.push(format!("Title: {title}"));
        }

        let state = if s.processing {
            let mut state = match s.query_elapsed_secs {
                Some(secs) => format!("working for {}", format_duration(secs)),
                None => "working".to_string(),
            };
            if let Some(tool) = &s.current_tool {
                state.push_str(&format!(", running {tool}"));
            }
            if s.stop_requested {
                state.push_str(", stop requested");
            }
            state
        } else {
            "idle".to_string()
        };
        lines.push(format!("Status: {state}"));

        if let Some(at) = s.last_activity {
            lines.push(format!("Last activity: {} ago", since(now, at)));
        }
        if let Some(tool) = &s.last_tool {
            lines.push(format!("Last tool: {tool}"));
        }
        if let Some(usage) = &s.last_usage {
            lines.push(format!(
                "Last turn tokens: {} in, {} out, {} cached",
                usage.input_tokens, usage.output_tokens, usage.cache_read_tokens
            ));
        }
        if let Some(err) = &s.last_error {
            match s.last_error_time {
                Some(at) => lines.push(format!("Last error ({} ago): {err}", since(now, at))),
                None => lines.push(format!("Last error: {err}")),
            }
        }

        if !self.accounts.is_empty() {
            lines.push("Accounts:".to_string());
            for a in &self.accounts {
                let marker = if a.current { '*' } else { ' ' };
                match a.cooldown_remaining_secs {
                    Some(secs) => lines.push(format!(
                        "{marker} {} (rate limited, {} left)",
                        a.name,
                        format_duration(secs)
                    )),
                    None => lines.push(format!("{marker} {}", a.name)),
                }
            }
        }

        lines.join("\n")
    }
}

fn since(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    format_duration((now - then).num_seconds().max(0) as u64)
}

/// Compact duration: `45s`, `3m 20s`, `2h 5m`.
pub fn format_duration(secs: u64) -> String {
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => {
            let (m, s) = (secs / 60, secs % 60);
            if s == 0 {
                format!("{m}m")
            } else {
                format!("{m}m {s}s")
            }
        }
        _ => {
            let (h, m) = (secs / 3600, (secs % 3600) / 60);
            if m == 0 {
                format!("{h}h")
            } else {
                format!("{h}h {m}m")
            }
        }
    }
}
