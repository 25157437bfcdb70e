//! Client Session
//!
//! The subscription side of one downstream connection. A session owns the
//! subscriber's [`SubscriberHandle`], applies control messages against the
//! registry and guarantees the subscriber is removed exactly once, whether
//! the connection closes cleanly, errors, or the task is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::application::services::Relay;
use crate::domain::stream::{StreamKey, StreamType, Symbol};
use crate::domain::subscription::SubscriberId;
use crate::infrastructure::broadcast::{DeliveryReport, OutboundFrame, SubscriberHandle};
use crate::infrastructure::metrics::{self, DeliveryPath, SessionKind};

use super::protocol::{ControlAction, ControlMessage};

/// What a session subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionScope {
    /// Raw exchange frames; control messages default to this stream type.
    Stream(StreamType),
    /// Summary envelopes keyed by symbol.
    Summary,
}

impl SessionScope {
    const fn kind(self) -> SessionKind {
        match self {
            Self::Stream(_) => SessionKind::Stream,
            Self::Summary => SessionKind::Summary,
        }
    }
}

/// One subscriber's registrations.
pub struct ClientSession {
    relay: Arc<Relay>,
    handle: SubscriberHandle,
    scope: SessionScope,
    closed: AtomicBool,
}

impl ClientSession {
    /// Open a session. Nothing is registered until
    /// [`subscribe_initial`](Self::subscribe_initial) or [`apply`](Self::apply).
    #[must_use]
    pub fn open(relay: Arc<Relay>, handle: SubscriberHandle, scope: SessionScope) -> Self {
        metrics::session_opened(scope.kind());
        tracing::info!(subscriber_id = handle.id(), scope = ?scope, "Session opened");

        Self {
            relay,
            handle,
            scope,
            closed: AtomicBool::new(false),
        }
    }

    /// Subscriber id.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.handle.id()
    }

    /// Session scope.
    #[must_use]
    pub const fn scope(&self) -> SessionScope {
        self.scope
    }

    /// Register the subscriptions named by the connection parameters.
    pub async fn subscribe_initial(&self, symbols: Vec<Symbol>) {
        self.apply(ControlMessage {
            action: ControlAction::Subscribe,
            symbols,
            stream_type: None,
        })
        .await;
    }

    /// Decode and apply one text frame. Undecodable frames are ignored.
    pub async fn handle_text(&self, text: &str) {
        match ControlMessage::parse(text) {
            Ok(message) => self.apply(message).await,
            Err(e) => {
                tracing::debug!(subscriber_id = self.id(), error = %e, "Ignoring control message");
            }
        }
    }

    /// Apply a control message to the registry.
    pub async fn apply(&self, message: ControlMessage) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        match self.scope {
            SessionScope::Stream(default_type) => {
                let stream_type = message.stream_type.unwrap_or(default_type);
                self.apply_streams(message.action, stream_type, &message.symbols);
            }
            SessionScope::Summary => {
                self.apply_summaries(message.action, &message.symbols);
                if message.action == ControlAction::Subscribe {
                    self.send_cached(&message.symbols).await;
                }
            }
        }
    }

    fn apply_streams(&self, action: ControlAction, stream_type: StreamType, symbols: &[Symbol]) {
        let keys: Vec<StreamKey> = symbols
            .iter()
            .filter_map(|symbol| StreamKey::new(stream_type, symbol).ok())
            .collect();
        let registry = self.relay.registry();

        match action {
            ControlAction::Subscribe => {
                for key in keys {
                    registry.register(&self.handle, key);
                }
            }
            ControlAction::Unsubscribe => {
                for key in &keys {
                    registry.unregister(self.id(), key);
                }
            }
            ControlAction::Replace => registry.replace_streams(&self.handle, &keys),
        }

        tracing::debug!(
            subscriber_id = self.id(),
            action = ?action,
            streams = ?registry.stream_keys_of(self.id()),
            "Applied stream control"
        );
    }

    fn apply_summaries(&self, action: ControlAction, symbols: &[Symbol]) {
        let registry = self.relay.registry();

        match action {
            ControlAction::Subscribe => {
                for symbol in symbols {
                    registry.register_summary(&self.handle, symbol);
                }
            }
            ControlAction::Unsubscribe => {
                for symbol in symbols {
                    registry.unregister_summary(self.id(), symbol);
                }
            }
            ControlAction::Replace => registry.replace_summaries(&self.handle, symbols),
        }

        tracing::debug!(
            subscriber_id = self.id(),
            action = ?action,
            symbols = ?registry.summary_symbols_of(self.id()),
            "Applied summary control"
        );
    }

    async fn send_cached(&self, symbols: &[Symbol]) {
        let mut report = DeliveryReport::default();

        for symbol in symbols {
            let Some(record) = self.relay.cached_summary(symbol).await else {
                continue;
            };
            match record.to_envelope_json() {
                Ok(json) => {
                    let frame: OutboundFrame = json.into();
                    report.record(self.handle.try_deliver(&frame));
                }
                Err(e) => {
                    tracing::warn!(symbol = %symbol, error = %e, "Failed to encode cached summary");
                }
            }
        }

        metrics::record_delivery(DeliveryPath::Snapshot, &report);
    }

    /// Remove every registration. Safe to call more than once.
    pub fn teardown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.relay.registry().remove_subscriber(self.id());
        metrics::session_closed(self.scope.kind());
        tracing::info!(subscriber_id = self.id(), "Session closed");
    }

    /// Whether [`teardown`](Self::teardown) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.teardown();
    }
}
