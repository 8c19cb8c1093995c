//! Prometheus metrics exposition
//!
//! - `bridge_sends_total` (counter): labels `backend`, `outcome`
//! - `bridge_send_duration_seconds` (histogram): label `backend`
//! - `bridge_rotations_total` (counter): label `result`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Agent turns run from seconds to the engine timeout.
const SEND_DURATION_BUCKETS: &[f64] = &[
    0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("bridge_send_duration_seconds".to_string()),
            SEND_DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `bridge_send_duration_seconds` gets explicit buckets so it renders as a
/// histogram rather than a summary.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a settled send. `outcome` is `ok` or the error label.
pub fn record_send(backend: &str, outcome: &str, duration_secs: f64) {
    metrics::counter!(
        "bridge_sends_total",
        "backend" => backend.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    metrics::histogram!("bridge_send_duration_seconds", "backend" => backend.to_string())
        .record(duration_secs);
}

/// Record an account rotation attempt.
pub fn record_rotation(rotated: bool) {
    let result = if rotated { "rotated" } else { "exhausted" };
    metrics::counter!("bridge_rotations_total", "result" => result).increment(1);
}
