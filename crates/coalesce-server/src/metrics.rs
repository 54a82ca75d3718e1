//! Prometheus instrumentation.
//!
//! Recording goes through the `metrics` facade and is a no-op until
//! [`start_metrics_server`] installs the exporter.

use anyhow::{Context, Result};
use coalesce_core::FlushStats;
use metrics::{counter, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{Ipv4Addr, SocketAddr};
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "coalesce_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "coalesce_connections_active";
    pub const FRAMES_TOTAL: &str = "coalesce_frames_total";
    pub const FRAME_BYTES_TOTAL: &str = "coalesce_frame_bytes_total";
    pub const ROOMS_ACTIVE: &str = "coalesce_rooms_active";
    pub const SUBSCRIPTIONS_TOTAL: &str = "coalesce_subscriptions_total";
    pub const WINDOWS_FLUSHED_TOTAL: &str = "coalesce_windows_flushed_total";
    pub const SENDS_TOTAL: &str = "coalesce_sends_total";
    pub const WINDOW_PUBLICATIONS: &str = "coalesce_window_publications";
    pub const WINDOW_BYTES: &str = "coalesce_window_bytes";
    pub const ERRORS_TOTAL: &str = "coalesce_errors_total";
}

/// Register descriptions for every metric.
pub fn init_metrics() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    describe_counter!(names::CONNECTIONS_TOTAL, "Connections accepted since start");
    describe_gauge!(names::CONNECTIONS_ACTIVE, "Open connections");
    describe_counter!(names::FRAMES_TOTAL, "Frames by direction");
    describe_counter!(
        names::FRAME_BYTES_TOTAL,
        Unit::Bytes,
        "Frame bytes by direction"
    );
    describe_gauge!(names::ROOMS_ACTIVE, "Rooms with at least one subscriber");
    describe_counter!(names::SUBSCRIPTIONS_TOTAL, "Successful room joins");
    describe_counter!(names::WINDOWS_FLUSHED_TOTAL, "Batching windows flushed");
    describe_counter!(
        names::SENDS_TOTAL,
        "Per-recipient outcomes of flushed windows by kind"
    );
    describe_histogram!(
        names::WINDOW_PUBLICATIONS,
        Unit::Count,
        "Publications coalesced per window"
    );
    describe_histogram!(names::WINDOW_BYTES, Unit::Bytes, "Shared buffer size per window");
    describe_counter!(names::ERRORS_TOTAL, "Errors by kind");

    info!("Metrics initialized");
}

/// Install the Prometheus exporter on `0.0.0.0:port`.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed or bound.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("Failed to install Prometheus exporter on {addr}"))?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Count one frame crossing a connection.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAME_BYTES_TOTAL, "direction" => direction).increment(bytes as u64);
}

/// Count a connection joining a room it was not already in.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Set the number of live rooms.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Record the outcome of one flushed window.
pub fn record_flush(stats: &FlushStats) {
    counter!(names::WINDOWS_FLUSHED_TOTAL).increment(1);

    for (kind, count) in [
        ("verbatim", stats.verbatim),
        ("reconstructed", stats.reconstructed),
        ("suppressed", stats.suppressed),
    ] {
        counter!(names::SENDS_TOTAL, "kind" => kind).increment(count as u64);
    }

    histogram!(names::WINDOW_PUBLICATIONS).record(stats.publications as f64);
    histogram!(names::WINDOW_BYTES).record(stats.buffer_len as f64);
}

/// Count one error, labelled by where it happened (`frame`, `websocket`, ...).
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Keeps the open-connection gauge in step with a connection task.
///
/// Counts the connection when created and releases it when dropped, so
/// every exit path of the task is covered.
pub struct ConnectionGauge(());

impl ConnectionGauge {
    /// Count a newly accepted connection. Hold the guard for the
    /// connection's lifetime.
    #[must_use]
    pub fn open() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self(())
    }
}

impl Drop for ConnectionGauge {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
