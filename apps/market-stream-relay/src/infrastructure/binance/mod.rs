//! Binance WebSocket Feed
//!
//! [`FeedSource`](crate::application::ports::FeedSource) adapter for
//! Binance public raw streams.
//!
//! # Stream URL
//!
//! - Production: `wss://stream.binance.com:9443/ws/{symbol}@{stream}`
//!
//! # Protocol
//!
//! Each raw stream is its own connection. The server sends JSON text
//! frames and pings every few minutes; tungstenite answers pings
//! automatically.

/// Feed adapter over tokio-tungstenite.
pub mod feed;

pub use feed::{BinanceFeed, DEFAULT_BASE_URL};
