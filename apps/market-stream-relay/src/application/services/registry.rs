//! Subscription Registry
//!
//! Owns every subscription and every upstream connector. A connector exists
//! for a [`StreamKey`] exactly while at least one subscriber holds that key:
//! the first registration spawns it, the last unregistration cancels it.
//!
//! # Locking
//!
//! Two locks, always taken in this order:
//!
//! 1. `connectors` (mutex) serializes every mutation, so check-and-spawn and
//!    check-and-cancel are atomic with respect to each other.
//! 2. `state` (rwlock) holds the books and subscriber handles; the fan-out
//!    router only ever takes its read side.
//!
//! No operation awaits network I/O while holding either lock. Spawning a
//! connector is a non-blocking `tokio::spawn`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::connector::{ConnectorFactory, ConnectorHandle, ConnectorSnapshot};
use crate::domain::stream::{StreamKey, Symbol};
use crate::domain::subscription::{
    AddOutcome, RemoveOutcome, SubscriberId, SubscriptionBook, SubscriptionStats,
};
use crate::infrastructure::broadcast::SubscriberHandle;
use crate::infrastructure::metrics;

// =============================================================================
// Subscription State
// =============================================================================

/// Books and delivery handles, shared with the fan-out router.
#[derive(Debug, Default)]
pub struct SubscriptionState {
    /// Raw stream subscriptions.
    pub streams: SubscriptionBook<StreamKey>,
    /// Summary subscriptions by lowercase symbol.
    pub summaries: SubscriptionBook<Symbol>,
    handles: HashMap<SubscriberId, SubscriberHandle>,
}

impl SubscriptionState {
    /// Remember a subscriber's delivery handle.
    pub fn attach(&mut self, handle: &SubscriberHandle) {
        self.handles
            .entry(handle.id())
            .or_insert_with(|| handle.clone());
    }

    /// Forget a handle once the subscriber holds nothing.
    pub fn release_if_idle(&mut self, subscriber: SubscriberId) {
        if !self.streams.is_subscribed_anywhere(subscriber)
            && !self.summaries.is_subscribed_anywhere(subscriber)
        {
            self.handles.remove(&subscriber);
        }
    }

    /// Handles subscribed to a raw stream.
    #[must_use]
    pub fn stream_handles(&self, key: &StreamKey) -> Vec<SubscriberHandle> {
        self.collect_handles(self.streams.subscribers_of(key))
    }

    /// Handles subscribed to a symbol's summaries.
    #[must_use]
    pub fn summary_handles(&self, symbol: &str) -> Vec<SubscriberHandle> {
        self.collect_handles(self.summaries.subscribers_of(&symbol.to_string()))
    }

    /// Number of subscribers with a live handle.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    fn collect_handles(&self, ids: Vec<SubscriberId>) -> Vec<SubscriberHandle> {
        ids.into_iter()
            .filter_map(|id| self.handles.get(&id).cloned())
            .collect()
    }
}

/// Registry-wide counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Raw stream book counts.
    pub streams: SubscriptionStats,
    /// Summary book counts.
    pub summaries: SubscriptionStats,
    /// Running upstream connectors.
    pub connectors: usize,
    /// Subscribers holding at least one subscription.
    pub subscribers: usize,
}

fn normalize(symbol: &str) -> Symbol {
    symbol.trim().to_ascii_lowercase()
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Owner of subscriptions and connector lifecycles.
pub struct SubscriptionRegistry {
    state: Arc<RwLock<SubscriptionState>>,
    connectors: Mutex<HashMap<StreamKey, ConnectorHandle>>,
    factory: ConnectorFactory,
    shutdown: CancellationToken,
}

impl SubscriptionRegistry {
    /// Create a registry over shared state.
    #[must_use]
    pub fn new(state: Arc<RwLock<SubscriptionState>>, factory: ConnectorFactory) -> Self {
        Self {
            state,
            connectors: Mutex::new(HashMap::new()),
            factory,
            shutdown: CancellationToken::new(),
        }
    }

    /// Shared subscription state.
    #[must_use]
    pub fn state(&self) -> Arc<RwLock<SubscriptionState>> {
        Arc::clone(&self.state)
    }

    // =========================================================================
    // Raw Streams
    // =========================================================================

    /// Subscribe to a raw stream, spawning its connector on first use.
    ///
    /// Returns `false` if the subscriber already held the key, or if the
    /// registry has been shut down.
    pub fn register(&self, handle: &SubscriberHandle, key: StreamKey) -> bool {
        let mut connectors = self.connectors.lock();
        self.register_locked(&mut connectors, handle, key)
    }

    /// Unsubscribe from a raw stream, cancelling its connector on last use.
    ///
    /// Returns `false` if the subscriber did not hold the key.
    pub fn unregister(&self, subscriber: SubscriberId, key: &StreamKey) -> bool {
        let mut connectors = self.connectors.lock();
        self.unregister_locked(&mut connectors, subscriber, key)
    }

    /// Make `keys` the subscriber's complete set of raw streams.
    ///
    /// Keys held both before and after keep their connector running.
    pub fn replace_streams(&self, handle: &SubscriberHandle, keys: &[StreamKey]) {
        let mut connectors = self.connectors.lock();
        let wanted: HashSet<&StreamKey> = keys.iter().collect();
        let current = self.state.read().streams.keys_of(handle.id());

        for key in current.iter().filter(|key| !wanted.contains(key)) {
            self.unregister_locked(&mut connectors, handle.id(), key);
        }
        for key in wanted {
            self.register_locked(&mut connectors, handle, key.clone());
        }
    }

    fn register_locked(
        &self,
        connectors: &mut HashMap<StreamKey, ConnectorHandle>,
        handle: &SubscriberHandle,
        key: StreamKey,
    ) -> bool {
        // `shutdown` cancels before draining under the same lock, so nothing
        // registered here can outlive the drain.
        if self.shutdown.is_cancelled() {
            tracing::debug!(
                stream = %key,
                subscriber_id = handle.id(),
                "Registry shut down, refusing subscription"
            );
            return false;
        }

        let outcome = {
            let mut state = self.state.write();
            state.attach(handle);
            state.streams.add(handle.id(), key.clone())
        };

        match outcome {
            AddOutcome::Activated => {
                tracing::info!(stream = %key, "First subscriber, starting connector");
                let connector = self.factory.spawn(key.clone(), &self.shutdown);
                connectors.insert(key, connector);
                metrics::set_active_connectors(connectors.len());
                true
            }
            AddOutcome::Joined => true,
            AddOutcome::AlreadySubscribed => false,
        }
    }

    fn unregister_locked(
        &self,
        connectors: &mut HashMap<StreamKey, ConnectorHandle>,
        subscriber: SubscriberId,
        key: &StreamKey,
    ) -> bool {
        let outcome = {
            let mut state = self.state.write();
            let outcome = state.streams.remove(subscriber, key);
            state.release_if_idle(subscriber);
            outcome
        };

        match outcome {
            RemoveOutcome::Deactivated => {
                Self::cancel_connector(connectors, key);
                true
            }
            RemoveOutcome::Left => true,
            RemoveOutcome::NotSubscribed => false,
        }
    }

    fn cancel_connector(connectors: &mut HashMap<StreamKey, ConnectorHandle>, key: &StreamKey) {
        if let Some(connector) = connectors.remove(key) {
            tracing::info!(stream = %key, "Last subscriber left, cancelling connector");
            metrics::record_connector_cancelled(key.stream_type());
            // Detached; the task observes cancellation at its next await point.
            drop(connector.cancel());
        }
        metrics::set_active_connectors(connectors.len());
    }

    // =========================================================================
    // Summaries
    // =========================================================================

    /// Subscribe to summaries for a symbol.
    ///
    /// Returns `false` if the subscriber already held the symbol.
    pub fn register_summary(&self, handle: &SubscriberHandle, symbol: &str) -> bool {
        let _serialize = self.connectors.lock();
        let mut state = self.state.write();
        state.attach(handle);
        state.summaries.add(handle.id(), normalize(symbol)) != AddOutcome::AlreadySubscribed
    }

    /// Unsubscribe from summaries for a symbol.
    ///
    /// Returns `false` if the subscriber did not hold the symbol.
    pub fn unregister_summary(&self, subscriber: SubscriberId, symbol: &str) -> bool {
        let _serialize = self.connectors.lock();
        let mut state = self.state.write();
        let outcome = state.summaries.remove(subscriber, &normalize(symbol));
        state.release_if_idle(subscriber);
        outcome != RemoveOutcome::NotSubscribed
    }

    /// Make `symbols` the subscriber's complete set of summary symbols.
    pub fn replace_summaries(&self, handle: &SubscriberHandle, symbols: &[Symbol]) {
        let _serialize = self.connectors.lock();
        let wanted: HashSet<Symbol> = symbols.iter().map(|s| normalize(s)).collect();

        let mut state = self.state.write();
        for symbol in state.summaries.keys_of(handle.id()) {
            if !wanted.contains(&symbol) {
                state.summaries.remove(handle.id(), &symbol);
            }
        }

        state.attach(handle);
        for symbol in wanted {
            state.summaries.add(handle.id(), symbol);
        }
        state.release_if_idle(handle.id());
    }

    // =========================================================================
    // Subscriber Lifecycle
    // =========================================================================

    /// Drop every subscription held by a subscriber. Idempotent.
    pub fn remove_subscriber(&self, subscriber: SubscriberId) {
        let mut connectors = self.connectors.lock();

        let released = {
            let mut state = self.state.write();
            state.summaries.remove_subscriber(subscriber);
            let released = state.streams.remove_subscriber(subscriber);
            state.handles.remove(&subscriber);
            released
        };

        for key in &released {
            Self::cancel_connector(&mut connectors, key);
        }
    }

    /// Cancel every connector and wait for each task to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let drained: Vec<ConnectorHandle> = {
            let mut connectors = self.connectors.lock();
            connectors.drain().map(|(_, connector)| connector).collect()
        };

        tracing::info!(connectors = drained.len(), "Shutting down connectors");

        for connector in drained {
            let key = connector.key().clone();
            if let Err(e) = connector.cancel().await {
                tracing::warn!(stream = %key, error = %e, "Connector task failed");
            }
        }

        metrics::set_active_connectors(0);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Raw stream keys held by a subscriber.
    #[must_use]
    pub fn stream_keys_of(&self, subscriber: SubscriberId) -> Vec<StreamKey> {
        self.state.read().streams.keys_of(subscriber)
    }

    /// Summary symbols held by a subscriber.
    #[must_use]
    pub fn summary_symbols_of(&self, subscriber: SubscriberId) -> Vec<Symbol> {
        self.state.read().summaries.keys_of(subscriber)
    }

    /// Subscribers on a raw stream.
    #[must_use]
    pub fn subscriber_count(&self, key: &StreamKey) -> usize {
        self.state.read().streams.subscriber_count(key)
    }

    /// Subscribers on a symbol's summaries.
    #[must_use]
    pub fn summary_subscriber_count(&self, symbol: &str) -> usize {
        self.state.read().summaries.subscriber_count(&normalize(symbol))
    }

    /// Whether a connector is running for `key`.
    #[must_use]
    pub fn has_connector(&self, key: &StreamKey) -> bool {
        self.connectors.lock().contains_key(key)
    }

    /// Status of every running connector.
    #[must_use]
    pub fn active_connectors(&self) -> Vec<ConnectorSnapshot> {
        let connectors = self.connectors.lock();
        let mut snapshots: Vec<_> = connectors
            .values()
            .map(|connector| connector.status().snapshot(connector.key()))
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Registry-wide counts.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let connectors = self.connectors.lock().len();
        let state = self.state.read();
        RegistryStats {
            streams: state.streams.stats(),
            summaries: state.summaries.stats(),
            connectors,
            subscribers: state.handle_count(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::StreamExt;
    use proptest::prelude::*;

    use super::*;
    use crate::application::ports::{FeedError, FeedSource, FeedStream};
    use crate::application::services::connector::ConnectorSettings;
    use crate::application::services::projector::SummaryProjector;
    use crate::application::services::reconnect::ReconnectConfig;
    use crate::application::services::router::FanoutRouter;
    use crate::domain::stream::StreamType;
    use crate::infrastructure::cache::CacheWriter;

    /// Feed whose streams stay open without producing frames.
    struct IdleFeed;

    #[async_trait]
    impl FeedSource for IdleFeed {
        async fn connect(&self, _key: &StreamKey) -> Result<FeedStream, FeedError> {
            Ok(futures::stream::pending().boxed())
        }
    }

    fn registry() -> SubscriptionRegistry {
        let state = Arc::new(RwLock::new(SubscriptionState::default()));
        let router = FanoutRouter::new(Arc::clone(&state));
        let (writer, _rx) = CacheWriter::new(8);
        let projector = SummaryProjector::new(router.clone(), writer);
        let factory = ConnectorFactory::new(
            Arc::new(IdleFeed),
            router,
            projector,
            ConnectorSettings {
                reconnect: ReconnectConfig::fixed(Duration::from_millis(10)),
                connect_timeout: Duration::from_secs(1),
            },
        );
        SubscriptionRegistry::new(state, factory)
    }

    fn key(symbol: &str) -> StreamKey {
        StreamKey::new(StreamType::Ticker, symbol).unwrap()
    }

    fn handle(id: SubscriberId) -> SubscriberHandle {
        SubscriberHandle::with_id(id, 8).0
    }

    #[tokio::test]
    async fn two_subscribers_share_one_connector() {
        let registry = registry();
        let (a, b) = (handle(1), handle(2));

        assert!(registry.register(&a, key("btcusdt")));
        assert!(registry.register(&b, key("btcusdt")));

        assert_eq!(registry.active_connectors().len(), 1);
        assert_eq!(registry.subscriber_count(&key("btcusdt")), 2);

        registry.unregister(1, &key("btcusdt"));
        assert!(registry.has_connector(&key("btcusdt")));

        registry.unregister(2, &key("btcusdt"));
        assert!(!registry.has_connector(&key("btcusdt")));
        assert_eq!(registry.subscriber_count(&key("btcusdt")), 0);
    }

    #[tokio::test]
    async fn duplicate_register_is_noop() {
        let registry = registry();
        let a = handle(1);

        assert!(registry.register(&a, key("btcusdt")));
        assert!(!registry.register(&a, key("btcusdt")));
        assert_eq!(registry.subscriber_count(&key("btcusdt")), 1);
    }

    #[tokio::test]
    async fn unregister_unknown_is_noop() {
        let registry = registry();
        let a = handle(1);
        registry.register(&a, key("btcusdt"));

        assert!(!registry.unregister(2, &key("btcusdt")));
        assert!(!registry.unregister(1, &key("ethusdt")));
        assert!(registry.has_connector(&key("btcusdt")));
    }

    #[tokio::test]
    async fn replace_streams_keeps_shared_connectors() {
        let registry = registry();
        let a = handle(1);

        registry.register(&a, key("btcusdt"));
        registry.register(&a, key("ethusdt"));
        assert_eq!(registry.active_connectors().len(), 2);

        registry.replace_streams(&a, &[key("ethusdt"), key("solusdt")]);

        let mut keys = registry.stream_keys_of(1);
        keys.sort_by_key(ToString::to_string);
        assert_eq!(keys, vec![key("ethusdt"), key("solusdt")]);
        assert!(!registry.has_connector(&key("btcusdt")));
        assert!(registry.has_connector(&key("ethusdt")));
        assert!(registry.has_connector(&key("solusdt")));
    }

    #[tokio::test]
    async fn replace_summaries_leaves_no_residue() {
        let registry = registry();
        let a = handle(1);

        registry.register_summary(&a, "BTCUSDT");
        registry.replace_summaries(&a, &["ETHUSDT".to_string()]);

        assert_eq!(registry.summary_symbols_of(1), vec!["ethusdt".to_string()]);
        assert_eq!(registry.summary_subscriber_count("BTCUSDT"), 0);
        assert_eq!(registry.summary_subscriber_count("ethusdt"), 1);
    }

    #[tokio::test]
    async fn replace_summaries_with_empty_list_releases_handle() {
        let registry = registry();
        let a = handle(1);

        registry.register_summary(&a, "BTCUSDT");
        registry.replace_summaries(&a, &[]);

        assert!(registry.summary_symbols_of(1).is_empty());
        assert_eq!(registry.stats().subscribers, 0);
    }

    #[tokio::test]
    async fn summaries_have_no_connector() {
        let registry = registry();
        let a = handle(1);

        assert!(registry.register_summary(&a, "BTCUSDT"));
        assert!(!registry.register_summary(&a, "btcusdt"));

        assert!(registry.active_connectors().is_empty());
        assert!(registry.unregister_summary(1, "BtcUsdt"));
        assert!(!registry.unregister_summary(1, "btcusdt"));
    }

    #[tokio::test]
    async fn remove_subscriber_is_idempotent() {
        let registry = registry();
        let (a, b) = (handle(1), handle(2));

        registry.register(&a, key("btcusdt"));
        registry.register(&a, key("ethusdt"));
        registry.register(&b, key("btcusdt"));
        registry.register_summary(&a, "BTCUSDT");

        registry.remove_subscriber(1);
        registry.remove_subscriber(1);

        assert!(registry.stream_keys_of(1).is_empty());
        assert!(registry.summary_symbols_of(1).is_empty());
        assert!(registry.has_connector(&key("btcusdt")));
        assert!(!registry.has_connector(&key("ethusdt")));
        assert_eq!(registry.stats().subscribers, 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_all_connectors() {
        let registry = registry();
        let a = handle(1);

        registry.register(&a, key("btcusdt"));
        registry.register(&a, key("ethusdt"));
        assert_eq!(registry.active_connectors().len(), 2);

        tokio::time::timeout(Duration::from_secs(1), registry.shutdown())
            .await
            .unwrap();

        assert!(registry.active_connectors().is_empty());
    }

    #[tokio::test]
    async fn register_after_shutdown_is_refused() {
        let registry = registry();
        let a = handle(1);
        registry.shutdown().await;

        assert!(!registry.register(&a, key("btcusdt")));
        registry.replace_streams(&a, &[key("ethusdt")]);

        assert!(!registry.has_connector(&key("btcusdt")));
        assert!(!registry.has_connector(&key("ethusdt")));
        assert_eq!(registry.subscriber_count(&key("btcusdt")), 0);
        assert!(registry.stream_keys_of(1).is_empty());
        assert_eq!(registry.stats().subscribers, 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(SubscriberId, usize),
        Unregister(SubscriberId, usize),
        Remove(SubscriberId),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..4u64, 0..3usize).prop_map(|(s, k)| Op::Register(s, k)),
            (0..4u64, 0..3usize).prop_map(|(s, k)| Op::Unregister(s, k)),
            (0..4u64).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn connector_exists_iff_key_has_subscribers(ops in prop::collection::vec(op(), 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let _guard = runtime.enter();

            let registry = registry();
            let keys = [key("btcusdt"), key("ethusdt"), key("solusdt")];
            let handles: Vec<_> = (0..4).map(handle).collect();

            for op in ops {
                match op {
                    Op::Register(s, k) => {
                        registry.register(&handles[usize::try_from(s).unwrap()], keys[k].clone());
                    }
                    Op::Unregister(s, k) => {
                        registry.unregister(s, &keys[k]);
                    }
                    Op::Remove(s) => registry.remove_subscriber(s),
                }

                for key in &keys {
                    prop_assert_eq!(
                        registry.has_connector(key),
                        registry.subscriber_count(key) > 0
                    );
                }
            }

            runtime.block_on(registry.shutdown());
        }
    }
}
