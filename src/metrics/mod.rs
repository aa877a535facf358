//! Prometheus metrics for the data layer.
//!
//! - Partition fan-out per query (histogram, by resource type)
//! - Partitioned read failures (counter, by resource type and operation)

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    pub const PARTITIONED_CURSOR_PARTITIONS: &str = "fhir_partitioned_cursor_partitions";
    pub const PARTITIONED_CURSOR_ERRORS_TOTAL: &str = "fhir_partitioned_cursor_errors_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized
/// or another recorder is installed.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }
            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

/// Record how many partitions a query opened.
pub fn record_partitions_opened(resource_type: &str, partitions: usize) {
    histogram!(
        names::PARTITIONED_CURSOR_PARTITIONS,
        "resource_type" => resource_type.to_string()
    )
    .record(partitions as f64);
}

/// Record a failed partitioned read.
pub fn record_cursor_error(resource_type: &str, operation: &'static str) {
    counter!(
        names::PARTITIONED_CURSOR_ERRORS_TOTAL,
        "resource_type" => resource_type.to_string(),
        "operation" => operation
    )
    .increment(1);
}
