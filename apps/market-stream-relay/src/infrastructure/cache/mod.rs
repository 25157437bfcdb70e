//! Summary Cache Adapters
//!
//! Implementations of [`SummaryCache`] plus the write queue that keeps cache
//! latency off the fan-out path.
//!
//! # Backends
//!
//! - [`RedisCache`]: `SET key value EX ttl` through a reconnecting
//!   `ConnectionManager`
//! - [`InMemoryCache`]: process-local TTL map, used when no Redis URL is
//!   configured or Redis is unreachable at startup
//!
//! # Write Path
//!
//! ```text
//! SummaryProjector ──try_send──► CacheWriter queue ──► run_cache_writer ──► SummaryCache::set
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{CacheError, SummaryCache};
use crate::domain::summary::SummaryRecord;
use crate::infrastructure::metrics::{self, CacheFailure};

/// Upper bound on the initial Redis connection attempt.
const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        Self::Backend(e.to_string())
    }
}

// =============================================================================
// In-Memory Cache
// =============================================================================

/// Process-local cache with per-entry expiry.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not yet evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl SummaryCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

// =============================================================================
// Redis Cache
// =============================================================================

/// Redis-backed cache.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        let conn = tokio::time::timeout(REDIS_CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::Backend("timed out connecting to redis".to_string()))??;
        Ok(Self { conn })
    }
}

#[async_trait]
impl SummaryCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Build the configured cache backend.
///
/// Falls back to [`InMemoryCache`] when no URL is given or Redis cannot be
/// reached.
pub async fn cache_from_url(redis_url: Option<&str>) -> Arc<dyn SummaryCache> {
    let Some(url) = redis_url else {
        tracing::info!("No REDIS_URL configured, using in-memory summary cache");
        return Arc::new(InMemoryCache::new());
    };

    match RedisCache::connect(url).await {
        Ok(cache) => {
            tracing::info!("Connected to Redis summary cache");
            Arc::new(cache)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Redis unavailable, falling back to in-memory summary cache");
            Arc::new(InMemoryCache::new())
        }
    }
}

// =============================================================================
// Cache Writer
// =============================================================================

/// One pending cache write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheWrite {
    /// Cache key, `summary:{symbol}`.
    pub key: String,
    /// Serialized [`SummaryRecord`].
    pub value: String,
}

/// Producer side of the cache write queue.
#[derive(Debug, Clone)]
pub struct CacheWriter {
    tx: mpsc::Sender<CacheWrite>,
}

impl CacheWriter {
    /// Create a queue with the given capacity (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<CacheWrite>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a record without waiting. Returns `false` if it was dropped.
    pub fn enqueue(&self, record: &SummaryRecord) -> bool {
        let value = match serde_json::to_string(record) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(symbol = %record.symbol, error = %e, "Failed to encode summary for cache");
                return false;
            }
        };

        let write = CacheWrite {
            key: record.cache_key(),
            value,
        };

        match self.tx.try_send(write) {
            Ok(()) => true,
            Err(TrySendError::Full(write)) => {
                tracing::debug!(key = %write.key, "Cache write queue full, dropping summary");
                metrics::record_cache_failure(CacheFailure::QueueFull);
                false
            }
            Err(TrySendError::Closed(write)) => {
                tracing::debug!(key = %write.key, "Cache writer stopped, dropping summary");
                false
            }
        }
    }
}

/// Drain the write queue into `cache` until cancelled or the queue closes.
pub async fn run_cache_writer(
    mut rx: mpsc::Receiver<CacheWrite>,
    cache: Arc<dyn SummaryCache>,
    ttl: Duration,
    cancel: CancellationToken,
) {
    loop {
        let write = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            write = rx.recv() => match write {
                Some(write) => write,
                None => break,
            },
        };

        if let Err(e) = cache.set(&write.key, &write.value, ttl).await {
            tracing::warn!(key = %write.key, error = %e, "Summary cache write failed");
            metrics::record_cache_failure(CacheFailure::Backend);
        }
    }

    tracing::debug!("Cache writer stopped");
}

// =============================================================================
// Tests
// =============================================================================
