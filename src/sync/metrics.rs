//! Sync metrics, recorded through the `metrics` facade
//!
//! The daemon installs a Prometheus recorder and serves it at `/metrics`.
//! Without a recorder every call here is a no-op.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::{Error, Result};

/// Install the global Prometheus recorder and describe all metrics
///
/// # Errors
///
/// Returns error if a recorder is already installed
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Config(format!("failed to install Prometheus recorder: {e}")))?;

    register_metrics();
    tracing::info!("prometheus metrics recorder installed");

    Ok(handle)
}

/// Describe every metric emitted by the sync core
pub fn register_metrics() {
    describe_counter!(
        "context_sync_attempts_total",
        "Context pack fetch attempts by source and outcome"
    );
    describe_histogram!(
        "context_pack_payload_bytes",
        "Size of accepted context pack bodies in bytes"
    );
    describe_counter!(
        "context_pack_truncated_total",
        "Context packs that exceeded a size cap and were truncated"
    );
    describe_counter!(
        "context_merge_conflicts_total",
        "Merge conflicts on priority and freshest fields"
    );
    describe_counter!("context_sweeps_total", "Per-user sweeps by result");
    describe_gauge!(
        "context_snapshot_age_seconds",
        "Age of the snapshot served at chat time"
    );
}

/// Record one fetch attempt
pub fn record_attempt(source_id: &str, outcome: &'static str) {
    metrics::counter!(
        "context_sync_attempts_total",
        "source_id" => source_id.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record the body size of an accepted pack
#[allow(clippy::cast_precision_loss)]
pub fn record_payload_bytes(source_id: &str, bytes: usize) {
    metrics::histogram!("context_pack_payload_bytes", "source_id" => source_id.to_string())
        .record(bytes as f64);
}

/// Record a truncated pack
pub fn record_truncated(source_id: &str) {
    metrics::counter!("context_pack_truncated_total", "source_id" => source_id.to_string())
        .increment(1);
}

/// Record a merge conflict on `field`
pub fn record_conflict(field: &str) {
    metrics::counter!("context_merge_conflicts_total", "field" => field.to_string()).increment(1);
}

/// Record the result of a per-user sweep
pub fn record_sweep(outcome: &'static str) {
    metrics::counter!("context_sweeps_total", "outcome" => outcome).increment(1);
}

/// Set the age of the snapshot served for a user class
pub fn set_snapshot_age(user_class: &'static str, seconds: f64) {
    metrics::gauge!("context_snapshot_age_seconds", "user_class" => user_class).set(seconds);
}
