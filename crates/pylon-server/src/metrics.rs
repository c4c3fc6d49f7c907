//! Metrics collection and export for Pylon.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "pylon_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "pylon_connections_active";
    pub const DISPATCH_TOTAL: &str = "pylon_dispatch_total";
    pub const REJECTIONS_TOTAL: &str = "pylon_rejections_total";
    pub const BREAKER_OPENS_TOTAL: &str = "pylon_breaker_opens_total";
    pub const BROADCAST_FAILURES_TOTAL: &str = "pylon_broadcast_failures_total";
    pub const DISPATCH_SECONDS: &str = "pylon_dispatch_seconds";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::DISPATCH_TOTAL,
        "Total number of dispatched requests by status"
    );
    metrics::describe_counter!(
        names::REJECTIONS_TOTAL,
        "Total number of rejected connections/messages by reason"
    );
    metrics::describe_counter!(
        names::BREAKER_OPENS_TOTAL,
        "Total number of circuit-open rejections by dependency"
    );
    metrics::describe_counter!(
        names::BROADCAST_FAILURES_TOTAL,
        "Total number of failed broadcast deliveries"
    );
    metrics::describe_histogram!(
        names::DISPATCH_SECONDS,
        "Request dispatch latency in seconds"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a dispatch outcome.
pub fn record_dispatch(status: &'static str) {
    counter!(names::DISPATCH_TOTAL, "status" => status).increment(1);
}

/// Record a rejected connection or message.
pub fn record_rejection(reason: &'static str) {
    counter!(names::REJECTIONS_TOTAL, "reason" => reason).increment(1);
}

/// Record a circuit-open rejection.
pub fn record_breaker_open(dependency: &'static str) {
    counter!(names::BREAKER_OPENS_TOTAL, "dependency" => dependency).increment(1);
}

/// Record failed broadcast deliveries.
pub fn record_broadcast_failures(count: usize) {
    if count > 0 {
        counter!(names::BROADCAST_FAILURES_TOTAL).increment(count as u64);
    }
}

/// Record dispatch latency.
pub fn record_dispatch_latency(seconds: f64) {
    histogram!(names::DISPATCH_SECONDS).record(seconds);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // Just test that it doesn't panic
        let _guard = ConnectionMetricsGuard::new();
    }
}
