//! Metrics instrumentation for the replicated state machine.
//!
//! Uses the `metrics` crate for backend-agnostic collection; the embedding
//! process picks the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `rsm_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_bytes` suffix for size histograms
//!
//! # Labels
//! - `log`: the delta log id the instance is bound to
//! - `status`: success, error, rejected

use metrics::{counter, gauge, histogram};

use crate::types::{Lsn, LogId};

/// Record one applied delta and its payload size.
pub fn record_delta_applied(log: LogId, bytes: usize) {
    counter!("rsm_deltas_applied_total", "log" => log.to_string()).increment(1);
    histogram!("rsm_delta_bytes", "log" => log.to_string()).record(bytes as f64);
}

/// Record a delta skipped because a snapshot already covered it.
pub fn record_delta_skipped(log: LogId) {
    counter!("rsm_deltas_skipped_total", "log" => log.to_string()).increment(1);
}

/// Record a delta that decoded or applied with an error.
pub fn record_delta_failed(log: LogId) {
    counter!("rsm_deltas_failed_total", "log" => log.to_string()).increment(1);
}

/// Record an applied snapshot (bootstrap or fast-forward).
pub fn record_snapshot_applied(log: LogId) {
    counter!("rsm_snapshots_applied_total", "log" => log.to_string()).increment(1);
}

/// Record a snapshot that could not be decoded.
pub fn record_snapshot_decode_error(log: LogId) {
    counter!("rsm_snapshot_decode_errors_total", "log" => log.to_string()).increment(1);
}

/// Record the outcome of writing a snapshot.
pub fn record_snapshot_written(log: LogId, status: &'static str, bytes: usize) {
    counter!(
        "rsm_snapshots_written_total",
        "log" => log.to_string(),
        "status" => status
    )
    .increment(1);
    if status == "success" {
        histogram!("rsm_snapshot_bytes", "log" => log.to_string()).record(bytes as f64);
    }
}

/// Track how many instances are stalled waiting for a snapshot.
pub fn set_stalled(log: LogId, stalled: bool) {
    let gauge = gauge!("rsm_stalled", "log" => log.to_string());
    if stalled {
        gauge.increment(1.0);
    } else {
        gauge.decrement(1.0);
    }
}

/// Publish the version reflected in the in-memory state.
pub fn set_version(log: LogId, version: Lsn) {
    gauge!("rsm_version", "log" => log.to_string()).set(version.0 as f64);
}

/// Current number of writes awaiting applied-locally confirmation.
pub fn set_pending_confirmations(log: LogId, pending: usize) {
    gauge!("rsm_pending_confirmations", "log" => log.to_string()).set(pending as f64);
}

/// Record the resolution of a confirmed write.
pub fn record_confirmation(log: LogId, status: &'static str) {
    counter!(
        "rsm_confirmations_total",
        "log" => log.to_string(),
        "status" => status
    )
    .increment(1);
}
