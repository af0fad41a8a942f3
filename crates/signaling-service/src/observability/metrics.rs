//! Metrics definitions for the signaling service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sig_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `cmd`: registered commands plus `unknown` (~12 values)
//! - `code`: response code labels (13 values)
//! - `operation`: presence store calls (~7 values)
//! - `reason` / `outcome` / `job`: 2-4 values each

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Dispatch latency: in-process handlers plus at most one cache/RPC hop
        .set_buckets_for_metric(
            Matcher::Prefix("sig_dispatch".to_string()),
            &[
                0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set dispatch latency buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("sig_presence".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set presence latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Connections
// ============================================================================

/// Metric: `sig_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sig_connections_active").set(count as f64);
}

/// Metric: `sig_users_logged_in`
pub fn set_users_logged_in(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sig_users_logged_in").set(count as f64);
}

/// Metric: `sig_connections_opened_total`
pub fn record_connection_opened() {
    counter!("sig_connections_opened_total").increment(1);
}

/// Metric: `sig_connections_closed_total`
pub fn record_connection_closed() {
    counter!("sig_connections_closed_total").increment(1);
}

// ============================================================================
// Dispatch
// ============================================================================

/// Record one dispatched client message.
///
/// Metrics: `sig_dispatch_total` (labels `cmd`, `code`) and
/// `sig_dispatch_duration_seconds` (label `cmd`).
pub fn record_dispatch(cmd: &str, code: &str, duration: Duration) {
    counter!("sig_dispatch_total", "cmd" => cmd.to_string(), "code" => code.to_string())
        .increment(1);
    histogram!("sig_dispatch_duration_seconds", "cmd" => cmd.to_string())
        .record(duration.as_secs_f64());
}

/// Metric: `sig_handler_panics_total`
/// Labels: `cmd`
pub fn record_handler_panic(cmd: &str) {
    counter!("sig_handler_panics_total", "cmd" => cmd.to_string()).increment(1);
}

/// Frames not delivered to a local connection.
///
/// Metric: `sig_broadcast_drops_total`
/// Labels: `reason` (full, closed, encode)
pub fn record_broadcast_drop(reason: &str) {
    counter!("sig_broadcast_drops_total", "reason" => reason.to_string()).increment(1);
}

// ============================================================================
// Registry
// ============================================================================

/// Metric: `sig_registry_queue_depth`
///
/// Sum of pending events across the registry queues. A growing value means
/// the registry consumer is falling behind.
pub fn set_registry_queue_depth(depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sig_registry_queue_depth").set(depth as f64);
}

// ============================================================================
// Presence cache
// ============================================================================

/// Metric: `sig_presence_latency_seconds`
/// Labels: `operation`
pub fn record_presence_latency(operation: &str, duration: Duration) {
    histogram!("sig_presence_latency_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

/// Metric: `sig_presence_errors_total`
/// Labels: `operation`, `kind` (unavailable, timeout, corrupt)
pub fn record_presence_error(operation: &str, kind: &str) {
    counter!("sig_presence_errors_total",
        "operation" => operation.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

// ============================================================================
// Relay
// ============================================================================

/// Metric: `sig_relay_calls_total`
/// Labels: `operation`, `outcome` (success, error, remote_error)
pub fn record_relay_call(operation: &str, outcome: &str) {
    counter!("sig_relay_calls_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ============================================================================
// Reaper
// ============================================================================

/// Metric: `sig_reaper_evictions_total`
pub fn record_reaper_evictions(count: usize) {
    counter!("sig_reaper_evictions_total").increment(count as u64);
}

/// Metric: `sig_reaper_panics_total`
/// Labels: `job`
pub fn record_reaper_panic(job: &str) {
    counter!("sig_reaper_panics_total", "job" => job.to_string()).increment(1);
}
