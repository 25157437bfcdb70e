//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Messages**: Upstream messages received, frames delivered and dropped by path
//! - **Connectors**: Active upstream connectors, spawns, cancels, reconnects
//! - **Sessions**: Active downstream WebSocket sessions
//! - **Projection**: Summaries projected and cache write failures
//! - **Latency**: Per-message fan-out and projection time
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::stream::StreamType;
use crate::infrastructure::broadcast::DeliveryReport;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Repeated calls return the handle installed first.
///
/// # Errors
///
/// Returns the exporter error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Message counters
    describe_counter!(
        "relay_upstream_messages_total",
        "Total messages received from upstream exchange streams"
    );
    describe_counter!(
        "relay_messages_delivered_total",
        "Total frames queued to downstream subscribers"
    );
    describe_counter!(
        "relay_messages_dropped_total",
        "Total frames dropped for full or closed subscriber queues"
    );

    // Connector gauges and counters
    describe_gauge!(
        "relay_active_connectors",
        "Number of running upstream connectors"
    );
    describe_counter!(
        "relay_connector_spawns_total",
        "Total upstream connectors started"
    );
    describe_counter!(
        "relay_connector_cancels_total",
        "Total upstream connectors cancelled"
    );
    describe_counter!(
        "relay_reconnects_total",
        "Total upstream reconnection attempts"
    );

    // Session gauges
    describe_gauge!(
        "relay_active_sessions",
        "Number of connected downstream WebSocket sessions"
    );

    // Projection counters
    describe_counter!(
        "relay_projections_total",
        "Total summary records projected from upstream messages"
    );
    describe_counter!(
        "relay_cache_write_failures_total",
        "Total summary cache writes that were dropped or failed"
    );

    // Latency histograms
    describe_histogram!(
        "relay_message_processing_seconds",
        "Time to fan out and project one upstream message"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Delivery path label.
#[derive(Debug, Clone, Copy)]
pub enum DeliveryPath {
    /// Raw exchange frames.
    Raw,
    /// Summary envelopes.
    Summary,
    /// Cached summary sent on subscribe.
    Snapshot,
}

impl DeliveryPath {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Summary => "summary",
            Self::Snapshot => "snapshot",
        }
    }
}

/// Downstream session kind label.
#[derive(Debug, Clone, Copy)]
pub enum SessionKind {
    /// Raw stream session.
    Stream,
    /// Summary session.
    Summary,
}

impl SessionKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Summary => "summary",
        }
    }
}

/// Reason a cache write did not land.
#[derive(Debug, Clone, Copy)]
pub enum CacheFailure {
    /// Writer queue was full.
    QueueFull,
    /// Backend returned an error.
    Backend,
}

impl CacheFailure {
    const fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::Backend => "backend",
        }
    }
}

/// Record a message received from an upstream stream.
pub fn record_upstream_message(stream_type: StreamType) {
    counter!(
        "relay_upstream_messages_total",
        "stream_type" => stream_type.to_string()
    )
    .increment(1);
}

/// Record the outcome of one fan-out.
pub fn record_delivery(path: DeliveryPath, report: &DeliveryReport) {
    if report.delivered > 0 {
        counter!("relay_messages_delivered_total", "path" => path.as_str())
            .increment(report.delivered as u64);
    }
    if report.dropped > 0 {
        counter!(
            "relay_messages_dropped_total",
            "path" => path.as_str(),
            "reason" => "full"
        )
        .increment(report.dropped as u64);
    }
    if report.closed > 0 {
        counter!(
            "relay_messages_dropped_total",
            "path" => path.as_str(),
            "reason" => "closed"
        )
        .increment(report.closed as u64);
    }
}

/// Update the running connector count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_connectors(count: usize) {
    gauge!("relay_active_connectors").set(count as f64);
}

/// Record a connector start.
pub fn record_connector_spawned(stream_type: StreamType) {
    counter!(
        "relay_connector_spawns_total",
        "stream_type" => stream_type.to_string()
    )
    .increment(1);
}

/// Record a connector cancellation.
pub fn record_connector_cancelled(stream_type: StreamType) {
    counter!(
        "relay_connector_cancels_total",
        "stream_type" => stream_type.to_string()
    )
    .increment(1);
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect(stream_type: StreamType) {
    counter!(
        "relay_reconnects_total",
        "stream_type" => stream_type.to_string()
    )
    .increment(1);
}

/// Adjust the active session gauge.
pub fn session_opened(kind: SessionKind) {
    gauge!("relay_active_sessions", "kind" => kind.as_str()).increment(1.0);
}

/// Adjust the active session gauge.
pub fn session_closed(kind: SessionKind) {
    gauge!("relay_active_sessions", "kind" => kind.as_str()).decrement(1.0);
}

/// Record a projected summary.
pub fn record_projection(kind: &'static str) {
    counter!("relay_projections_total", "kind" => kind).increment(1);
}

/// Record a cache write that did not land.
pub fn record_cache_failure(reason: CacheFailure) {
    counter!(
        "relay_cache_write_failures_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record per-message processing duration.
pub fn record_processing_duration(stream_type: StreamType, duration: Duration) {
    histogram!(
        "relay_message_processing_seconds",
        "stream_type" => stream_type.to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_strings() {
        assert_eq!(DeliveryPath::Raw.as_str(), "raw");
        assert_eq!(DeliveryPath::Summary.as_str(), "summary");
        assert_eq!(DeliveryPath::Snapshot.as_str(), "snapshot");
        assert_eq!(SessionKind::Stream.as_str(), "stream");
        assert_eq!(SessionKind::Summary.as_str(), "summary");
        assert_eq!(CacheFailure::QueueFull.as_str(), "queue_full");
        assert_eq!(CacheFailure::Backend.as_str(), "backend");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_delivery(
            DeliveryPath::Raw,
            &DeliveryReport {
                delivered: 2,
                dropped: 1,
                closed: 1,
            },
        );
        set_active_connectors(3);
        record_projection("kline");
    }
}
