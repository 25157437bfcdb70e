//! Binance raw stream client.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::Message;

use crate::application::ports::{FeedError, FeedFrame, FeedSource, FeedStream};
use crate::domain::stream::StreamKey;

/// Default Binance raw stream endpoint.
pub const DEFAULT_BASE_URL: &str = "wss://stream.binance.com:9443/ws";

/// Opens one Binance raw stream per key.
#[derive(Debug, Clone)]
pub struct BinanceFeed {
    base_url: String,
}

impl Default for BinanceFeed {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl BinanceFeed {
    /// Create a feed against `base_url` (trailing slashes are ignored).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url }
    }

    /// Full URL for a stream key.
    #[must_use]
    pub fn stream_url(&self, key: &StreamKey) -> String {
        format!("{}/{}", self.base_url, key.stream_name())
    }
}

/// Map a tungstenite message to a feed frame; control frames yield `None`.
fn to_frame(message: Message) -> Option<FeedFrame> {
    match message {
        Message::Text(text) => Some(FeedFrame::Text(text.as_str().to_owned())),
        Message::Binary(bytes) => Some(FeedFrame::Binary(bytes.to_vec())),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => None,
    }
}

#[async_trait]
impl FeedSource for BinanceFeed {
    async fn connect(&self, key: &StreamKey) -> Result<FeedStream, FeedError> {
        let url = self.stream_url(key);
        tracing::info!(url = %url, "Connecting to Binance stream");

        let (ws_stream, _response) =
            tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| FeedError::Connect {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;

        let frames = ws_stream.filter_map(|message| async move {
            match message {
                Ok(message) => to_frame(message).map(Ok),
                Err(e) => Some(Err(FeedError::Stream(e.to_string()))),
            }
        });

        Ok(frames.boxed())
    }
}
