//! Per-user session API
//!
//! Endpoints:
//! - GET    /v1/users/{user}/status     status report (JSON plus rendered text)
//! - POST   /v1/users/{user}/messages   send a message, stream updates as SSE
//! - POST   /v1/users/{user}/stop       abort the running send
//! - POST   /v1/users/{user}/interrupt  abort because a newer message follows
//! - DELETE /v1/users/{user}/session    destroy the backend session
//! - PUT    /v1/users/{user}/backend    route the user to another backend
//!
//! The message stream carries one SSE event per status update, named after
//! its kind (`thinking`, `tool`, `text`, `segment_end`, `done`), and always
//! ends with exactly one `result` or `error` event.

use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use session_engine::{EngineError, MultiplexError, StatusReport, StopOutcome};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, info, warn};

use crate::dispatch::Dispatcher;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Build the session API router.
pub fn build_api_router<S>(dispatcher: Dispatcher) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/v1/users/{user}/status", get(status))
        .route("/v1/users/{user}/messages", post(send_message))
        .route("/v1/users/{user}/stop", post(stop))
        .route("/v1/users/{user}/interrupt", post(interrupt))
        .route("/v1/users/{user}/session", delete(kill_session))
        .route("/v1/users/{user}/backend", put(set_backend))
        .with_state(dispatcher)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    json_response(status, serde_json::json!({ "error": message.into() }))
}

fn stop_label(outcome: StopOutcome) -> &'static str {
    match outcome {
        StopOutcome::Stopped => "stopped",
        StopOutcome::Pending => "pending",
        StopOutcome::NotRunning => "not_running",
    }
}

/// GET /v1/users/{user}/status
async fn status(State(dispatcher): State<Dispatcher>, Path(user): Path<String>) -> Response {
    let report = StatusReport::collect(dispatcher.mux(), dispatcher.pool(), &user);
    let text = report.render();
    json_response(
        StatusCode::OK,
        serde_json::json!({ "status": report, "text": text }),
    )
}

#[derive(Deserialize)]
struct SendRequest {
    message: String,
}

/// POST /v1/users/{user}/messages: SSE stream of the turn.
///
/// Rejects with 409 while another send runs on the engine this user is
/// routed to. The send runs in its own task so a client disconnect does not
/// cancel the turn.
async fn send_message(
    State(dispatcher): State<Dispatcher>,
    Path(user): Path<String>,
    axum::Json(body): axum::Json<SendRequest>,
) -> Response {
    let message = body.message.trim().to_string();
    if message.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "message must not be empty");
    }

    let Some(permit) = dispatcher.try_begin(&user) else {
        return json_error(
            StatusCode::CONFLICT,
            "a message is already being processed, stop or interrupt it first",
        );
    };

    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    info!(
        request_id,
        user,
        backend = permit.kind(),
        chars = message.len(),
        "message accepted"
    );

    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        let result = dispatcher.send(&permit, &user, &message, updates_tx).await;
        drop(permit);
        match &result {
            Ok(text) => info!(request_id, user, chars = text.len(), "message settled"),
            Err(e) => warn!(request_id, user, outcome = e.label(), error = %e, "message failed"),
        }
        let _ = done_tx.send(result);
    });

    let updates = UnboundedReceiverStream::new(updates_rx)
        .map(|update| Event::default().event(update.kind.as_str()).json_data(&update));
    let settled = stream::once(async move {
        match done_rx.await {
            Ok(result) => settlement_event(result),
            Err(_) => {
                error!("send task ended without settling");
                Event::default().event("error").json_data(serde_json::json!({
                    "error": "internal",
                    "message": "send task ended without a result",
                }))
            }
        }
    });

    Sse::new(updates.chain(settled))
        .keep_alive(
            KeepAlive::new()
                .interval(KEEP_ALIVE_INTERVAL)
                .text("keep-alive"),
        )
        .into_response()
}

fn settlement_event(result: Result<String, EngineError>) -> Result<Event, axum::Error> {
    match result {
        Ok(text) => Event::default()
            .event("result")
            .json_data(serde_json::json!({ "text": text })),
        Err(e) => {
            let mut body = serde_json::json!({
                "error": e.label(),
                "message": e.to_string(),
            });
            if let EngineError::Cancelled { interrupted } = e {
                body["interrupted"] = serde_json::Value::Bool(interrupted);
            }
            Event::default().event("error").json_data(body)
        }
    }
}

/// POST /v1/users/{user}/stop
async fn stop(State(dispatcher): State<Dispatcher>, Path(user): Path<String>) -> Response {
    let outcome = dispatcher.stop(&user).await;
    info!(user, outcome = stop_label(outcome), "stop requested");
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "was_running": outcome.was_running(),
            "outcome": stop_label(outcome),
        }),
    )
}

/// POST /v1/users/{user}/interrupt
async fn interrupt(State(dispatcher): State<Dispatcher>, Path(user): Path<String>) -> Response {
    let outcome = dispatcher.interrupt(&user).await;
    info!(user, outcome = stop_label(outcome), "interrupt requested");
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "was_running": outcome.was_running(),
            "outcome": stop_label(outcome),
        }),
    )
}

/// DELETE /v1/users/{user}/session
///
/// Idempotent. A send in flight settles as cancelled.
async fn kill_session(State(dispatcher): State<Dispatcher>, Path(user): Path<String>) -> Response {
    dispatcher.mux().kill(&user).await;
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "killed": true,
            "backend": dispatcher.mux().backend_for(&user),
        }),
    )
}

#[derive(Deserialize)]
struct SetBackendRequest {
    kind: String,
}

/// PUT /v1/users/{user}/backend
async fn set_backend(
    State(dispatcher): State<Dispatcher>,
    Path(user): Path<String>,
    axum::Json(body): axum::Json<SetBackendRequest>,
) -> Response {
    match dispatcher.mux().set_backend(&user, &body.kind).await {
        Ok(()) => json_response(
            StatusCode::OK,
            serde_json::json!({ "user": user, "backend": body.kind }),
        ),
        Err(e @ MultiplexError::UnknownBackend(_)) => json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({
                "error": e.to_string(),
                "available_backends": dispatcher.mux().kinds(),
            }),
        ),
        Err(e) => {
            error!(user, error = %e, "failed to persist backend preference");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
