//! Shared helpers for integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use market_stream_relay::application::services::{ConnectorSettings, ReconnectConfig};
use market_stream_relay::infrastructure::config::SessionSettings;
use market_stream_relay::infrastructure::server::{self, AppState};
use market_stream_relay::{
    FeedError, FeedFrame, FeedSource, FeedStream, InMemoryCache, Relay, RelaySettings, StreamKey,
    SummaryCache,
};

type FrameSender = mpsc::UnboundedSender<Result<FeedFrame, FeedError>>;

/// In-process upstream feed. Each connect opens a channel the test can push
/// frames into; the newest stream per key is the one `push` writes to.
#[derive(Default)]
pub struct ChannelFeed {
    live: Mutex<HashMap<StreamKey, Vec<FrameSender>>>,
    connects: AtomicUsize,
}

impl ChannelFeed {
    /// Total connection attempts.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Whether the newest upstream stream for `key` is open.
    pub fn is_open(&self, key: &StreamKey) -> bool {
        self.live
            .lock()
            .get(key)
            .and_then(|senders| senders.last())
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Upstream streams for `key` whose connector still holds the receiver.
    pub fn live_streams(&self, key: &StreamKey) -> usize {
        self.live
            .lock()
            .get(key)
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Push one text frame to the newest open stream for `key`.
    pub fn push(&self, key: &StreamKey, text: &str) -> bool {
        self.live
            .lock()
            .get(key)
            .and_then(|senders| senders.last())
            .is_some_and(|tx| tx.send(Ok(FeedFrame::Text(text.to_string()))).is_ok())
    }

    /// End every open stream for `key`, as if the exchange closed it.
    pub fn close(&self, key: &StreamKey) {
        self.live.lock().remove(key);
    }

    /// Wait until the stream for `key` is open.
    pub async fn wait_open(&self, key: &StreamKey) {
        eventually(|| self.is_open(key)).await;
    }

    /// Wait until the stream for `key` has been released.
    pub async fn wait_released(&self, key: &StreamKey) {
        eventually(|| !self.is_open(key)).await;
    }
}

#[async_trait]
impl FeedSource for ChannelFeed {
    async fn connect(&self, key: &StreamKey) -> Result<FeedStream, FeedError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut live = self.live.lock();
            let senders = live.entry(key.clone()).or_default();
            senders.retain(|tx| !tx.is_closed());
            senders.push(tx);
        }
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

/// Relay settings with short delays.
pub fn fast_settings() -> RelaySettings {
    RelaySettings {
        connector: ConnectorSettings {
            reconnect: ReconnectConfig::fixed(Duration::from_millis(20)),
            connect_timeout: Duration::from_secs(1),
        },
        ..RelaySettings::default()
    }
}

/// Relay wired to an in-process feed and in-memory cache.
pub fn test_relay() -> (Arc<Relay>, Arc<ChannelFeed>, Arc<InMemoryCache>) {
    let feed = Arc::new(ChannelFeed::default());
    let cache = Arc::new(InMemoryCache::new());
    let relay = Arc::new(Relay::start(
        Arc::clone(&feed) as Arc<dyn FeedSource>,
        Arc::clone(&cache) as Arc<dyn SummaryCache>,
        fast_settings(),
    ));
    (relay, feed, cache)
}

/// Serve sessions for `relay` on a loopback port.
pub async fn start_server(relay: Arc<Relay>) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();

    let state = Arc::new(AppState::new(
        relay,
        SessionSettings {
            buffer: 64,
            ping_interval: Duration::from_secs(30),
        },
        cancel.clone(),
    ));

    tokio::spawn(server::serve(listener, state, cancel.clone()));

    (addr, cancel)
}

/// Poll `condition` until it holds, failing after two seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 2s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
