//! Upstream Connector
//!
//! One task per [`StreamKey`]. The task keeps a single upstream connection
//! open, forwards every inbound frame to the fan-out router, projects it to a
//! summary, and reconnects after a backoff when the connection drops.
//!
//! # State Machine
//!
//! ```text
//!            ┌────────────┐   connected   ┌───────────┐
//!  start ──► │ Connecting │ ────────────► │ Streaming │
//!            └────────────┘               └───────────┘
//!                 ▲   │ failed                 │ error / closed
//!                 │   ▼                        ▼
//!                 │ ┌─────────────┐            │
//!                 └─┤ BackoffWait │ ◄──────────┘
//!                   └─────────────┘
//!
//!  any state ── cancel ──► Cancelled
//! ```
//!
//! Cancellation is checked at every await point (connect, read, backoff).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Instrument;

use super::projector::SummaryProjector;
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::router::FanoutRouter;
use crate::application::ports::{FeedError, FeedFrame, FeedSource, FeedStream};
use crate::domain::stream::{StreamKey, StreamType};
use crate::infrastructure::broadcast::OutboundFrame;
use crate::infrastructure::metrics;

/// Default upstream connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Connector State
// =============================================================================

/// Lifecycle state of one connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorState {
    /// Opening the upstream connection.
    Connecting,
    /// Connected and forwarding frames.
    Streaming,
    /// Waiting before the next connection attempt.
    BackoffWait,
    /// Stopped for good.
    Cancelled,
}

/// Live status shared between a connector task and observers.
#[derive(Debug)]
pub struct ConnectorStatus {
    state: parking_lot::RwLock<ConnectorState>,
    last_connected_at: parking_lot::RwLock<Option<DateTime<Utc>>>,
    last_error: parking_lot::RwLock<Option<String>>,
    messages_received: AtomicU64,
    reconnects: AtomicU64,
    started_at: DateTime<Utc>,
}

impl Default for ConnectorStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorStatus {
    /// Fresh status in the `Connecting` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: parking_lot::RwLock::new(ConnectorState::Connecting),
            last_connected_at: parking_lot::RwLock::new(None),
            last_error: parking_lot::RwLock::new(None),
            messages_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    /// Set the lifecycle state.
    pub fn set_state(&self, state: ConnectorState) {
        *self.state.write() = state;
        if state == ConnectorState::Streaming {
            *self.last_connected_at.write() = Some(Utc::now());
            *self.last_error.write() = None;
        }
    }

    /// Remember the last failure.
    pub fn set_error(&self, message: String) {
        *self.last_error.write() = Some(message);
    }

    /// Count one inbound frame.
    pub fn increment_messages(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one reconnection attempt.
    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectorState {
        *self.state.read()
    }

    /// Frames received since start.
    #[must_use]
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Reconnection attempts since start.
    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Point-in-time copy for reporting.
    #[must_use]
    pub fn snapshot(&self, key: &StreamKey) -> ConnectorSnapshot {
        ConnectorSnapshot {
            key: key.to_string(),
            stream_type: key.stream_type(),
            symbol: key.symbol().to_string(),
            state: self.state(),
            messages_received: self.messages_received(),
            reconnects: self.reconnects(),
            last_error: self.last_error.read().clone(),
            last_connected_at: *self.last_connected_at.read(),
            started_at: self.started_at,
        }
    }
}

/// Reported view of one connector.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorSnapshot {
    /// Display form of the stream key, e.g. `ticker:btcusdt`.
    pub key: String,
    /// Stream type.
    pub stream_type: StreamType,
    /// Lowercase symbol.
    pub symbol: String,
    /// Lifecycle state.
    pub state: ConnectorState,
    /// Frames received since start.
    pub messages_received: u64,
    /// Reconnection attempts since start.
    pub reconnects: u64,
    /// Most recent failure, cleared on successful connect.
    pub last_error: Option<String>,
    /// Last successful connect time.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Task start time.
    pub started_at: DateTime<Utc>,
}

// =============================================================================
// Connector Handle
// =============================================================================

/// Owning handle for a running connector task.
///
/// Dropping the handle cancels the task.
#[derive(Debug)]
pub struct ConnectorHandle {
    key: StreamKey,
    status: Arc<ConnectorStatus>,
    cancel_guard: DropGuard,
    task: JoinHandle<()>,
}

impl ConnectorHandle {
    /// Stream key served by this connector.
    #[must_use]
    pub const fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Shared live status.
    #[must_use]
    pub fn status(&self) -> Arc<ConnectorStatus> {
        Arc::clone(&self.status)
    }

    /// Whether the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal cancellation and return the task handle for awaiting.
    #[must_use = "await the handle or drop it to detach"]
    pub fn cancel(self) -> JoinHandle<()> {
        let Self {
            cancel_guard, task, ..
        } = self;
        drop(cancel_guard);
        task
    }
}

// =============================================================================
// Connector Factory
// =============================================================================

/// Tunables for upstream connectors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectorSettings {
    /// Delay schedule between reconnection attempts.
    pub reconnect: ReconnectConfig,
    /// Upper bound on one connection attempt.
    pub connect_timeout: Duration,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Spawns connector tasks wired to the shared router and projector.
#[derive(Clone)]
pub struct ConnectorFactory {
    feed: Arc<dyn FeedSource>,
    router: FanoutRouter,
    projector: SummaryProjector,
    settings: ConnectorSettings,
}

impl ConnectorFactory {
    /// Create a factory.
    #[must_use]
    pub fn new(
        feed: Arc<dyn FeedSource>,
        router: FanoutRouter,
        projector: SummaryProjector,
        settings: ConnectorSettings,
    ) -> Self {
        Self {
            feed,
            router,
            projector,
            settings,
        }
    }

    /// Start a connector for `key`, cancelled when `parent` is.
    ///
    /// Must be called from within a Tokio runtime. Does not block.
    #[must_use]
    pub fn spawn(&self, key: StreamKey, parent: &CancellationToken) -> ConnectorHandle {
        let cancel = parent.child_token();
        let status = Arc::new(ConnectorStatus::new());

        let connector = UpstreamConnector {
            key: key.clone(),
            feed: Arc::clone(&self.feed),
            router: self.router.clone(),
            projector: self.projector.clone(),
            settings: self.settings,
            status: Arc::clone(&status),
            cancel: cancel.clone(),
        };

        let span = tracing::info_span!("connector", stream = %key);
        let task = tokio::spawn(connector.run().instrument(span));

        metrics::record_connector_spawned(key.stream_type());

        ConnectorHandle {
            key,
            status,
            cancel_guard: cancel.drop_guard(),
            task,
        }
    }
}

// =============================================================================
// Upstream Connector
// =============================================================================

/// Why a streaming session ended.
enum PumpExit {
    Cancelled,
    Failed(FeedError),
}

struct UpstreamConnector {
    key: StreamKey,
    feed: Arc<dyn FeedSource>,
    router: FanoutRouter,
    projector: SummaryProjector,
    settings: ConnectorSettings,
    status: Arc<ConnectorStatus>,
    cancel: CancellationToken,
}

impl UpstreamConnector {
    async fn run(self) {
        let mut reconnect_policy = ReconnectPolicy::new(self.settings.reconnect);

        tracing::info!(stream = %self.key.stream_name(), "Connector started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.status.set_state(ConnectorState::Connecting);

            let connected = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = self.open() => result,
            };

            let error = match connected {
                Ok(stream) => {
                    tracing::info!("Upstream stream connected");
                    self.status.set_state(ConnectorState::Streaming);
                    reconnect_policy.reset();

                    match self.pump(stream).await {
                        PumpExit::Cancelled => break,
                        PumpExit::Failed(e) => e,
                    }
                }
                Err(e) => e,
            };

            tracing::warn!(error = %error, "Upstream connection lost");
            self.status.set_error(error.to_string());
            self.status.set_state(ConnectorState::BackoffWait);

            let delay = reconnect_policy.next_delay();
            tracing::info!(
                attempt = reconnect_policy.attempt_count(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting to upstream stream"
            );

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }

            self.status.increment_reconnects();
            metrics::record_reconnect(self.key.stream_type());
        }

        self.status.set_state(ConnectorState::Cancelled);
        tracing::info!("Connector cancelled");
    }

    async fn open(&self) -> Result<FeedStream, FeedError> {
        tokio::time::timeout(self.settings.connect_timeout, self.feed.connect(&self.key))
            .await
            .unwrap_or_else(|_| Err(FeedError::ConnectTimeout(self.key.stream_name())))
    }

    async fn pump(&self, mut stream: FeedStream) -> PumpExit {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return PumpExit::Cancelled,
                next = stream.next() => match next {
                    Some(Ok(frame)) => self.dispatch(frame),
                    Some(Err(e)) => return PumpExit::Failed(e),
                    None => return PumpExit::Failed(FeedError::Closed),
                },
            }
        }
    }

    /// Forward one frame verbatim, then project it.
    fn dispatch(&self, frame: FeedFrame) {
        let Some(text) = frame.into_text() else {
            tracing::debug!("Skipping non-UTF-8 binary frame");
            return;
        };

        let started = Instant::now();
        self.status.increment_messages();
        metrics::record_upstream_message(self.key.stream_type());

        let frame: OutboundFrame = text.into();
        let report = self.router.publish(&self.key, &frame);

        match serde_json::from_str::<serde_json::Value>(&frame) {
            Ok(value) => {
                self.projector.handle(&value);
            }
            Err(e) => {
                tracing::debug!(error = %e, "Upstream frame is not JSON, skipping projection");
            }
        }

        tracing::trace!(
            delivered = report.delivered,
            dropped = report.dropped,
            closed = report.closed,
            "Frame dispatched"
        );
        metrics::record_processing_duration(self.key.stream_type(), started.elapsed());
    }
}

// =============================================================================
// Tests
// =============================================================================
