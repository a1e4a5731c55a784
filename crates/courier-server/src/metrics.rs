//! Metrics collection and export for Courier.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use courier_core::DeliveryOutcome;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const FRAMES_TOTAL: &str = "courier_frames_total";
    pub const FRAMES_BYTES: &str = "courier_frames_bytes";
    pub const LATENCY_SECONDS: &str = "courier_latency_seconds";
    pub const ERRORS_TOTAL: &str = "courier_errors_total";
    pub const MESSAGES_PERSISTED: &str = "courier_messages_persisted_total";
    pub const DELIVERIES_TOTAL: &str = "courier_deliveries_total";
    pub const PRESENCE_BROADCASTS: &str = "courier_presence_broadcasts_total";
    pub const USERS_ONLINE: &str = "courier_users_online";
    pub const FANOUT_DEGRADED: &str = "courier_fanout_degraded";
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
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames processed");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");
    metrics::describe_counter!(names::MESSAGES_PERSISTED, "Messages written to the store");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Targeted deliveries by outcome (local, forwarded, dropped)"
    );
    metrics::describe_counter!(
        names::PRESENCE_BROADCASTS,
        "Presence changes announced by this process"
    );
    metrics::describe_gauge!(names::USERS_ONLINE, "Users registered on this process");
    metrics::describe_gauge!(
        names::FANOUT_DEGRADED,
        "1 when a configured fanout bridge could not be reached"
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

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record frame handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Record a persisted message and where it went.
pub fn record_delivery(outcome: DeliveryOutcome, persisted: bool) {
    if persisted {
        counter!(names::MESSAGES_PERSISTED).increment(1);
    }
    counter!(names::DELIVERIES_TOTAL, "outcome" => outcome.as_str()).increment(1);
}

pub fn record_presence_broadcast() {
    counter!(names::PRESENCE_BROADCASTS).increment(1);
}

pub fn set_users_online(count: usize) {
    gauge!(names::USERS_ONLINE).set(count as f64);
}

pub fn set_fanout_degraded(degraded: bool) {
    gauge!(names::FANOUT_DEGRADED).set(if degraded { 1.0 } else { 0.0 });
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
