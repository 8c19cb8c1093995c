//! Agent Bridge
//!
//! Single-binary service that:
//! 1. Loads the credential account pool (when configured)
//! 2. Builds one session engine per configured agent backend
//! 3. Routes each user to their preferred backend
//! 4. Serves the per-user session API with SSE progress streaming

mod api;
mod config;
mod dispatch;
mod metrics;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use account_pool::AccountPool;
use agent_backend::ProcessBackend;
use session_engine::{AgentSession, Multiplexer, SessionEngine};

use crate::config::Config;
use crate::dispatch::Dispatcher;

/// Time allowed for in-flight requests after the shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    dispatcher: Dispatcher,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// The concurrency limit counts open SSE streams too.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(api::build_api_router(state.dispatcher.clone()))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Build one engine per configured backend and the multiplexer over them.
async fn build_multiplexer(config: &Config, pool: Option<Arc<AccountPool>>) -> Result<Multiplexer> {
    let engine_config = config.engine_config();
    let mut engines: Vec<Arc<dyn AgentSession>> = Vec::with_capacity(config.backends.len());

    for backend in &config.backends {
        let mut engine = SessionEngine::new(
            Arc::new(ProcessBackend::new(backend.process_config())),
            engine_config,
        );
        if let Some(pool) = &pool {
            engine = engine.with_pool(pool.clone());
        }
        info!(
            backend = %backend.kind,
            command = %backend.command.display(),
            use_pool = engine.uses_account_pool(),
            "backend configured"
        );
        engines.push(Arc::new(engine));
    }

    let mux = Multiplexer::new(config.default_backend(), engines)
        .context("failed to build backend multiplexer")?;

    match &config.preferences_file {
        Some(path) => mux
            .with_preferences_file(path.clone())
            .await
            .with_context(|| format!("failed to load preferences from {}", path.display())),
        None => Ok(mux),
    }
}

async fn load_pool(config: &Config) -> Result<Option<Arc<AccountPool>>> {
    let Some(settings) = config.pool_settings() else {
        info!("no pool root configured, account rotation disabled");
        return Ok(None);
    };
    let root = settings.root.clone();
    let pool = AccountPool::load(settings)
        .await
        .with_context(|| format!("failed to load account pool under {}", root.display()))?;
    if pool.is_empty() {
        warn!(root = %root.display(), "account pool has no usable accounts");
    }
    Ok(Some(Arc::new(pool)))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting agent-bridge");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        backends = config.backends.len(),
        default_backend = config.default_backend(),
        pool_root = ?config.pool.root,
        "configuration loaded"
    );

    let pool = load_pool(&config).await?;
    let mux = Arc::new(build_multiplexer(&config, pool.clone()).await?);
    let dispatcher = Dispatcher::new(mux.clone(), pool);

    let app_state = AppState {
        dispatcher,
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts at signal receipt, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    // Agent processes must not outlive the bridge.
    mux.shutdown().await;

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: JSON with status, backends, pool summary, and uptime.
/// Returns 503 when a configured pool has no eligible account.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let mux = state.dispatcher.mux();
    let pool = state.dispatcher.pool().map(AccountPool::health);

    let status = pool
        .as_ref()
        .and_then(|p| p["status"].as_str())
        .unwrap_or("healthy")
        .to_string();
    let status_code = if status == "unhealthy" {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };

    let body = serde_json::json!({
        "status": status,
        "default_backend": mux.default_kind(),
        "backends": mux.kinds(),
        "pool": pool,
        "uptime_seconds": uptime,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint. Returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_pool::{AccountSources, PoolSettings};
    use agent_backend::memory::MemoryBackend;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use session_engine::EngineConfig;
    use tower::ServiceExt;

    /// Create a PrometheusHandle for tests without installing a global recorder.
    /// Using build_recorder() avoids the "recorder already installed" panic when
    /// multiple tests run in the same process.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    fn test_app_state(pool: Option<Arc<AccountPool>>) -> AppState {
        let backend = MemoryBackend::new("claude").with_account_pool();
        let mut engine = SessionEngine::new(Arc::new(backend), EngineConfig::default());
        if let Some(pool) = &pool {
            engine = engine.with_pool(pool.clone());
        }
        let mux = Multiplexer::new("claude", vec![Arc::new(engine) as Arc<dyn AgentSession>])
            .unwrap();

        AppState {
            dispatcher: Dispatcher::new(Arc::new(mux), pool),
            prometheus: test_prometheus_handle(),
            started_at: Instant::now(),
        }
    }

    async fn test_pool(dir: &std::path::Path, names: &[&str]) -> Arc<AccountPool> {
        for name in names {
            std::fs::create_dir_all(dir.join("instances").join(name)).unwrap();
        }
        Arc::new(
            AccountPool::from_names(
                PoolSettings {
                    root: dir.to_path_buf(),
                    env_var: "CLAUDE_CONFIG_DIR".into(),
                    cooldown: Duration::from_secs(3600),
                    sources: AccountSources::default(),
                },
                names.iter().map(|n| n.to_string()).collect(),
            )
            .await,
        )
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_without_pool_is_healthy() {
        let app = build_router(test_app_state(None), 100);

        let (status, json) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["default_backend"], "claude");
        assert_eq!(json["backends"], serde_json::json!(["claude"]));
        assert!(json["pool"].is_null());
        assert!(json["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn health_reports_pool_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path(), &["work", "personal"]).await;
        let app = build_router(test_app_state(Some(pool.clone())), 100);

        pool.mark_limited_and_rotate(None);
        let (status, json) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["pool"]["accounts_total"], 2);
        assert_eq!(json["pool"]["accounts_rate_limited"], 1);
    }

    #[tokio::test]
    async fn health_is_unavailable_when_every_account_is_limited() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path(), &["only"]).await;
        let app = build_router(test_app_state(Some(pool.clone())), 100);

        assert!(!pool.mark_limited_and_rotate(None));
        let (status, json) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "unhealthy");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_text() {
        let app = build_router(test_app_state(None), 100);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[axum::http::header::CONTENT_TYPE],
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn session_api_is_mounted() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path(), &["work"]).await;
        let app = build_router(test_app_state(Some(pool)), 100);

        let (status, json) = get_json(app, "/v1/users/alice/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"]["backend"], "claude");
        assert_eq!(json["status"]["account"]["name"], "work");
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = build_router(test_app_state(None), 100);

        let response = app
            .oneshot(Request::builder().uri("/v1/nothing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn multiplexer_is_built_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = dir.path().join("preferences.json");
        std::fs::write(&prefs, r#"{"alice":"codex"}"#).unwrap();

        let config: Config = toml::from_str(&format!(
            r#"
default_backend = "claude"
preferences_file = "{}"

[[backends]]
kind = "claude"
command = "claude-agent"

[[backends]]
kind = "codex"
command = "codex-agent"
"#,
            prefs.display()
        ))
        .unwrap();

        let mux = build_multiplexer(&config, None).await.unwrap();
        assert_eq!(mux.kinds(), vec!["claude", "codex"]);
        assert_eq!(mux.default_kind(), "claude");
        assert_eq!(mux.backend_for("alice"), "codex");
        assert_eq!(mux.backend_for("bob"), "claude");
        assert!(!mux.info("alice").active);
    }

    #[tokio::test]
    async fn missing_pool_root_disables_pool() {
        let config: Config = toml::from_str(
            r#"
[[backends]]
kind = "claude"
command = "claude-agent"
"#,
        )
        .unwrap();

        assert!(load_pool(&config).await.unwrap().is_none());
    }
}
