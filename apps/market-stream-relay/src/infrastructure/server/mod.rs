//! Downstream WebSocket Server
//!
//! Serves client sessions over axum WebSockets.
//!
//! # Endpoints
//!
//! - `GET /ws?symbol=btcusdt&stream_type=ticker` - raw exchange frames
//! - `GET /ws/summaries?symbols=BTCUSDT,ETHUSDT` - summary envelopes
//!
//! Both are also served under the `/market` prefix.
//!
//! Invalid connection parameters are rejected with `400` before the upgrade.
//!
//! # Session Tasks
//!
//! Each connection runs two tasks. The writer drains the subscriber's
//! bounded queue to the socket and sends periodic pings. The receive loop
//! applies control messages. Either side ending tears the session down.

pub mod protocol;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::application::services::Relay;
use crate::domain::stream::Symbol;
use crate::infrastructure::broadcast::{OutboundFrame, SubscriberHandle};
use crate::infrastructure::config::SessionSettings;

pub use protocol::{ControlAction, ControlError, ControlMessage, StreamParams, SummaryParams};
pub use session::{ClientSession, SessionScope};

// =============================================================================
// Application State
// =============================================================================

/// Shared state for session handlers.
pub struct AppState {
    relay: Arc<Relay>,
    session: SessionSettings,
    shutdown: CancellationToken,
}

impl AppState {
    /// Create new session handler state. Cancelling `shutdown` closes every
    /// open session.
    #[must_use]
    pub const fn new(
        relay: Arc<Relay>,
        session: SessionSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            relay,
            session,
            shutdown,
        }
    }

    /// The relay core.
    #[must_use]
    pub const fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }
}

/// Create the session router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(stream_handler))
        .route("/ws/summaries", get(summary_handler))
        .route("/market/ws", get(stream_handler))
        .route("/market/ws/summaries", get(summary_handler))
        .with_state(state)
}

// =============================================================================
// WebSocket Server
// =============================================================================

/// Downstream WebSocket server.
pub struct WsServer {
    port: u16,
    state: Arc<AppState>,
    cancel: CancellationToken,
}

impl WsServer {
    /// Create a new WebSocket server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<AppState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "WebSocket server listening");
        serve(listener, self.state, self.cancel).await?;
        tracing::info!("WebSocket server stopped");
        Ok(())
    }
}

/// Serve sessions on an already-bound listener until cancelled.
///
/// # Errors
///
/// Returns `ServerError::ServerFailed` if the HTTP server fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| ServerError::ServerFailed(e.to_string()))
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn stream_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<StreamParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match params.key() {
        Ok(key) => {
            let scope = SessionScope::Stream(key.stream_type());
            let symbols = vec![key.symbol().to_string()];
            ws.on_upgrade(move |socket| run_session(socket, state, scope, symbols))
        }
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn summary_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<SummaryParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match params.symbols() {
        Ok(symbols) => {
            ws.on_upgrade(move |socket| run_session(socket, state, SessionScope::Summary, symbols))
        }
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

// =============================================================================
// Session Loop
// =============================================================================

async fn run_session(
    socket: WebSocket,
    state: Arc<AppState>,
    scope: SessionScope,
    initial: Vec<Symbol>,
) {
    let (handle, outbound) = SubscriberHandle::channel(state.session.buffer);
    let span = tracing::info_span!("session", subscriber_id = handle.id());

    drive_session(socket, state, scope, initial, handle, outbound)
        .instrument(span)
        .await;
}

async fn drive_session(
    socket: WebSocket,
    state: Arc<AppState>,
    scope: SessionScope,
    initial: Vec<Symbol>,
    handle: SubscriberHandle,
    outbound: mpsc::Receiver<OutboundFrame>,
) {
    let (sink, mut inbound) = socket.split();
    let cancel = state.shutdown.child_token();

    let mut writer = tokio::spawn(
        write_loop(sink, outbound, state.session.ping_interval, cancel.clone())
            .in_current_span(),
    );
    let mut writer_done = false;

    let session = ClientSession::open(Arc::clone(&state.relay), handle, scope);
    session.subscribe_initial(initial).await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            message = inbound.next() => match message {
                Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Session receive failed");
                    break;
                }
            },
        }
    }

    session.teardown();
    cancel.cancel();
    if !writer_done {
        if let Err(e) = writer.await {
            tracing::warn!(error = %e, "Session writer task failed");
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    ping_every: Duration,
    cancel: CancellationToken,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            frame = outbound.recv() => match frame {
                Some(frame) => Message::Text(frame.to_string().into()),
                None => break,
            },
            _ = ping.tick() => Message::Ping(Vec::new().into()),
        };

        if let Err(e) = sink.send(message).await {
            tracing::debug!(error = %e, "Session send failed");
            break;
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// WebSocket server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}
