//! Store metrics collection.
//!
//! - Operation counters by backend, operation and outcome
//! - Latency histograms

use metrics::{counter, histogram};

/// Metric name constants for consistency.
pub mod names {
    /// Total store operations by backend, operation and status.
    pub const OPERATIONS_TOTAL: &str = "sgate_store_operations_total";

    /// Operation latency in seconds by backend and operation.
    pub const LATENCY_SECONDS: &str = "sgate_store_latency_seconds";
}

/// Record a completed store operation.
pub fn record_operation(backend: &'static str, operation: &'static str, success: bool, latency_ms: f64) {
    counter!(
        names::OPERATIONS_TOTAL,
        "backend" => backend,
        "operation" => operation,
        "status" => if success { "ok" } else { "error" }
    )
    .increment(1);

    histogram!(
        names::LATENCY_SECONDS,
        "backend" => backend,
        "operation" => operation
    )
    .record(latency_ms / 1000.0);
}
