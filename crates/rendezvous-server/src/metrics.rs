//! Metrics collection and export for Rendezvous.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use async_trait::async_trait;
use bytes::Bytes;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use rendezvous_core::FrameOutcome;
use rendezvous_transport::{PushError, PushTransport};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "rendezvous_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "rendezvous_connections_active";
    pub const FRAMES_TOTAL: &str = "rendezvous_frames_total";
    pub const FRAMES_BYTES: &str = "rendezvous_frames_bytes";
    pub const ROUTED_TOTAL: &str = "rendezvous_routed_total";
    pub const DELIVERIES_TOTAL: &str = "rendezvous_deliveries_total";
    pub const STALE_REMOVED_TOTAL: &str = "rendezvous_stale_removed_total";
    pub const LATENCY_SECONDS: &str = "rendezvous_latency_seconds";
    pub const ERRORS_TOTAL: &str = "rendezvous_errors_total";
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
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames by direction");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames by direction");
    metrics::describe_counter!(names::ROUTED_TOTAL, "Inbound frames by routing outcome");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Pushes accepted by the transport"
    );
    metrics::describe_counter!(
        names::STALE_REMOVED_TOTAL,
        "Connections found gone during delivery"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame routing latency in seconds"
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

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record how an inbound frame was routed.
pub fn record_outcome(outcome: &FrameOutcome) {
    let label = match outcome {
        FrameOutcome::Pong => "pong",
        FrameOutcome::Listed { .. } => "list",
        FrameOutcome::Notified { target: None, .. } => "notify_dropped",
        FrameOutcome::Notified { .. } => "notify",
        FrameOutcome::Broadcast => "broadcast",
        FrameOutcome::Opaque => "opaque",
    };
    counter!(names::ROUTED_TOTAL, "outcome" => label).increment(1);
}

/// Record routing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Transport wrapper that counts deliveries and gone connections.
pub struct MeteredTransport {
    inner: Arc<dyn PushTransport>,
}

impl MeteredTransport {
    #[must_use]
    pub fn new(inner: Arc<dyn PushTransport>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl PushTransport for MeteredTransport {
    async fn push(&self, handle: &str, payload: Bytes) -> Result<(), PushError> {
        let result = self.inner.push(handle, payload).await;
        match &result {
            Ok(()) => counter!(names::DELIVERIES_TOTAL).increment(1),
            Err(e) if e.is_gone() => counter!(names::STALE_REMOVED_TOTAL).increment(1),
            Err(_) => record_error("push"),
        }
        result
    }

    async fn disconnect(&self, handle: &str) -> Result<(), PushError> {
        self.inner.disconnect(handle).await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
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
