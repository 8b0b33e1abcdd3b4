//! Metrics collection and export for Whisper.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "whisper_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "whisper_connections_active";
    pub const SESSIONS_ACTIVE: &str = "whisper_sessions_active";
    pub const AUTH_FAILURES_TOTAL: &str = "whisper_auth_failures_total";
    pub const MESSAGES_TOTAL: &str = "whisper_messages_total";
    pub const MESSAGES_BYTES: &str = "whisper_messages_bytes";
    pub const RELAY_TOTAL: &str = "whisper_relay_total";
    pub const DEPARTURES_TOTAL: &str = "whisper_departures_total";
    pub const EVICTIONS_TOTAL: &str = "whisper_evictions_total";
    pub const LATENCY_SECONDS: &str = "whisper_latency_seconds";
    pub const ERRORS_TOTAL: &str = "whisper_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of WebSocket connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open WebSocket connections"
    );
    metrics::describe_gauge!(
        names::SESSIONS_ACTIVE,
        "Current number of identities in the registry"
    );
    metrics::describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Connection attempts rejected during authentication"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of events processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of events processed");
    metrics::describe_counter!(names::RELAY_TOTAL, "Private message relay attempts");
    metrics::describe_counter!(names::DEPARTURES_TOTAL, "Sessions that left the registry");
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Connections closed because a newer session took over"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound event processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

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

/// Record a rejected connection attempt.
pub fn record_auth_failure(reason: &'static str) {
    counter!(names::AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

/// Record an event.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record the outcome of a relay attempt.
pub fn record_relay(outcome: &'static str) {
    counter!(names::RELAY_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a session leaving the registry.
pub fn record_departure() {
    counter!(names::DEPARTURES_TOTAL).increment(1);
}

/// Record a superseded connection being closed.
pub fn record_eviction() {
    counter!(names::EVICTIONS_TOTAL).increment(1);
}

/// Record event processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Update the registered session count.
pub fn set_active_sessions(count: usize) {
    gauge!(names::SESSIONS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
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
