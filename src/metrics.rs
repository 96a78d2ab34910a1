//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Pending queue depth and state
//! - Operation outcomes (applied, retried, dropped)
//! - Apply latency
//! - Snapshot writes and loads
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! # Usage
//!
//! ```rust,no_run
//! use entity_replicator::metrics;
//! use std::time::Duration;
//!
//! metrics::record_operation_applied("create", Duration::from_millis(12));
//! metrics::set_queue_depth(3);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Queue Metrics
// =============================================================================

/// Gauge for the number of pending operations.
pub fn set_queue_depth(depth: usize) {
    gauge!("replication_queue_depth").set(depth as f64);
}

/// Gauge for queue state.
pub fn set_queue_state(state: &str) {
    // 0=running, 1=paused, 2=stopped
    let value = match state {
        "Running" => 0.0,
        "Paused" => 1.0,
        "Stopped" => 2.0,
        _ => -1.0,
    };
    gauge!("replication_queue_state").set(value);
}

/// Record an operation accepted into the queue.
pub fn record_operation_enqueued(kind: &str) {
    counter!("replication_operations_enqueued_total", "kind" => kind.to_string()).increment(1);
}

/// Record operations discarded by a rollback.
pub fn record_operations_rolled_back(count: usize) {
    counter!("replication_operations_rolled_back_total").increment(count as u64);
}

// =============================================================================
// Worker Metrics
// =============================================================================

/// Record an operation committed to the slave store.
pub fn record_operation_applied(kind: &str, duration: Duration) {
    counter!("replication_operations_applied_total", "kind" => kind.to_string()).increment(1);
    histogram!("replication_apply_duration_seconds", "kind" => kind.to_string())
        .record(duration.as_secs_f64());
}

/// Record a transient failure that keeps the operation at the head.
pub fn record_operation_retried(kind: &str) {
    counter!("replication_operations_retried_total", "kind" => kind.to_string()).increment(1);
}

/// Record an operation dropped after a permanent failure or exhausted retries.
pub fn record_operation_dropped(kind: &str, reason: &str) {
    counter!(
        "replication_operations_dropped_total",
        "kind" => kind.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

// =============================================================================
// Snapshot Metrics
// =============================================================================

/// Record a snapshot write attempt.
pub fn record_snapshot_write(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_snapshot_writes_total", "status" => status).increment(1);
}

/// Gauge for operations restored from the snapshot at startup.
pub fn set_snapshot_loaded(count: usize) {
    gauge!("replication_snapshot_loaded_operations").set(count as f64);
}

// =============================================================================
// Engine Metrics
// =============================================================================

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("replication_engine_state").set(value);
}
