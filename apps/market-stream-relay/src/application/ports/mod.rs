//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `FeedSource`: Opens one upstream exchange stream for a [`StreamKey`]
//! - `SummaryCache`: Key/value store with expiry for summary records

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::domain::stream::StreamKey;

// =============================================================================
// Feed Source
// =============================================================================

/// A single inbound frame from the upstream feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedFrame {
    /// Text frame (the normal case for exchange JSON).
    Text(String),
    /// Binary frame; treated as UTF-8 text when valid.
    Binary(Vec<u8>),
}

impl FeedFrame {
    /// Payload as text, if it is valid UTF-8.
    #[must_use]
    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(bytes) => String::from_utf8(bytes).ok(),
        }
    }
}

/// Errors from the upstream feed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FeedError {
    /// Connection could not be established.
    #[error("failed to connect to {url}: {reason}")]
    Connect {
        /// Target URL.
        url: String,
        /// Underlying failure.
        reason: String,
    },

    /// Connection attempt exceeded the connect timeout.
    #[error("connect timed out: {0}")]
    ConnectTimeout(String),

    /// The established stream failed.
    #[error("stream error: {0}")]
    Stream(String),

    /// The upstream closed the connection.
    #[error("connection closed by upstream")]
    Closed,
}

/// Stream of frames from one upstream connection.
///
/// The stream ends when the upstream closes the connection.
pub type FeedStream = BoxStream<'static, Result<FeedFrame, FeedError>>;

/// Opens upstream exchange streams.
#[async_trait]
pub trait FeedSource: Send + Sync + 'static {
    /// Connect to the stream identified by `key`.
    async fn connect(&self, key: &StreamKey) -> Result<FeedStream, FeedError>;
}

// =============================================================================
// Summary Cache
// =============================================================================

/// Errors from the summary cache.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// The backing store failed.
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Key/value store with per-entry expiry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SummaryCache: Send + Sync + 'static {
    /// Read a value; `None` on miss or expiry.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Write a value, overwriting any previous one, expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Remove a value. Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), CacheError>;
}
