//! Relay Composition
//!
//! Builds the shared state, router, projector, cache writer and registry,
//! and owns the background cache writer task.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connector::{ConnectorFactory, ConnectorSettings};
use super::projector::SummaryProjector;
use super::registry::{SubscriptionRegistry, SubscriptionState};
use super::router::FanoutRouter;
use crate::application::ports::{FeedSource, SummaryCache};
use crate::domain::summary::{SummaryRecord, cache_key};
use crate::infrastructure::cache::{CacheWriter, run_cache_writer};

/// Default summary expiry.
pub const DEFAULT_SUMMARY_TTL: Duration = Duration::from_secs(5);

/// Default cache write queue capacity.
pub const DEFAULT_CACHE_QUEUE_CAPACITY: usize = 1024;

/// Relay tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelaySettings {
    /// Upstream connector settings.
    pub connector: ConnectorSettings,
    /// Expiry of cached summaries.
    pub summary_ttl: Duration,
    /// Capacity of the cache write queue.
    pub cache_queue_capacity: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            connector: ConnectorSettings::default(),
            summary_ttl: DEFAULT_SUMMARY_TTL,
            cache_queue_capacity: DEFAULT_CACHE_QUEUE_CAPACITY,
        }
    }
}

/// The running relay core.
pub struct Relay {
    registry: Arc<SubscriptionRegistry>,
    router: FanoutRouter,
    cache: Arc<dyn SummaryCache>,
    cancel: CancellationToken,
    cache_writer: Mutex<Option<JoinHandle<()>>>,
}

impl Relay {
    /// Wire the relay and start the cache writer.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(
        feed: Arc<dyn FeedSource>,
        cache: Arc<dyn SummaryCache>,
        settings: RelaySettings,
    ) -> Self {
        let state = Arc::new(RwLock::new(SubscriptionState::default()));
        let router = FanoutRouter::new(Arc::clone(&state));

        let (writer, writes) = CacheWriter::new(settings.cache_queue_capacity);
        let cancel = CancellationToken::new();
        let cache_writer = tokio::spawn(run_cache_writer(
            writes,
            Arc::clone(&cache),
            settings.summary_ttl,
            cancel.child_token(),
        ));

        let projector = SummaryProjector::new(router.clone(), writer);
        let factory = ConnectorFactory::new(feed, router.clone(), projector, settings.connector);
        let registry = Arc::new(SubscriptionRegistry::new(state, factory));

        Self {
            registry,
            router,
            cache,
            cancel,
            cache_writer: Mutex::new(Some(cache_writer)),
        }
    }

    /// Subscription registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Fan-out router.
    #[must_use]
    pub const fn router(&self) -> &FanoutRouter {
        &self.router
    }

    /// Summary cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<dyn SummaryCache> {
        &self.cache
    }

    /// Latest cached summary for a symbol, if present and decodable.
    pub async fn cached_summary(&self, symbol: &str) -> Option<SummaryRecord> {
        let key = cache_key(symbol);
        match self.cache.get(&key).await {
            Ok(Some(value)) => match serde_json::from_str(&value) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "Ignoring undecodable cached summary");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Summary cache read failed");
                None
            }
        }
    }

    /// Whether the cache answers a ping.
    pub async fn cache_reachable(&self) -> bool {
        self.cache.ping().await.is_ok()
    }

    /// Stop all connectors and the cache writer.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
        self.cancel.cancel();

        let writer = self.cache_writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                tracing::warn!(error = %e, "Cache writer task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::StreamExt;

    use super::*;
    use crate::application::ports::{FeedError, FeedStream};
    use crate::domain::stream::StreamKey;
    use crate::infrastructure::cache::InMemoryCache;

    struct IdleFeed;

    #[async_trait]
    impl FeedSource for IdleFeed {
        async fn connect(&self, _key: &StreamKey) -> Result<FeedStream, FeedError> {
            Ok(futures::stream::pending().boxed())
        }
    }

    #[tokio::test]
    async fn cached_summary_round_trip() {
        let cache = Arc::new(InMemoryCache::new());
        let relay = Relay::start(Arc::new(IdleFeed), cache.clone(), RelaySettings::default());

        assert!(relay.cached_summary("BTCUSDT").await.is_none());

        cache
            .set(
                "summary:btcusdt",
                r#"{"symbol":"BTCUSDT","last_price":1.5,"volume":null,"ts":7}"#,
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let record = relay.cached_summary("BTCUSDT").await.unwrap();
        assert_eq!(record.last_price, Some(1.5));
        assert_eq!(record.timestamp, 7);

        cache.set("summary:ethusdt", "garbage", Duration::from_secs(5)).await.unwrap();
        assert!(relay.cached_summary("ethusdt").await.is_none());

        assert!(relay.cache_reachable().await);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_repeatable() {
        let relay = Relay::start(
            Arc::new(IdleFeed),
            Arc::new(InMemoryCache::new()),
            RelaySettings::default(),
        );

        relay.shutdown().await;
        relay.shutdown().await;
    }
}
