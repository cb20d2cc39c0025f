//! Prometheus metrics for the COSI node adapter
//!
//! Provides metrics for monitoring publish/unpublish operations, rollbacks
//! and finalizer updates.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total number of CSI operations by type and status
    pub const OPERATIONS_TOTAL: &str = "cosi_operations_total";
    /// Histogram: Duration of CSI operations in seconds
    pub const OPERATION_DURATION_SECONDS: &str = "cosi_operation_duration_seconds";
    /// Counter: Publish rollbacks by result (clean, failed)
    pub const ROLLBACKS_TOTAL: &str = "cosi_rollbacks_total";
    /// Counter: Finalizer writes on bucket accesses by action (add, remove)
    pub const FINALIZER_UPDATES_TOTAL: &str = "cosi_finalizer_updates_total";
    /// Counter: Number of retried cluster API writes
    pub const RETRIES_TOTAL: &str = "cosi_retries_total";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a CSI operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record a publish rollback and whether every undo step succeeded
pub fn record_rollback(clean: bool) {
    let result = if clean { "clean" } else { "failed" };
    counter!(names::ROLLBACKS_TOTAL, "result" => result).increment(1);
}

/// Record a finalizer write that changed a bucket access
pub fn record_finalizer_update(action: &'static str) {
    counter!(names::FINALIZER_UPDATES_TOTAL, "action" => action).increment(1);
}

/// Record a retry attempt
pub fn record_retry(operation: &str) {
    counter!(names::RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, error_code, duration);
    }
}
