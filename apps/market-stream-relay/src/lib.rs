#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Stream Relay - Exchange Feed Multiplexer
//!
//! A WebSocket relay that keeps exactly one upstream exchange stream per
//! (stream type, symbol) pair while at least one client wants it, fans every
//! frame out to all interested clients, and derives a small summary record
//! per symbol that is cached and pushed to summary subscribers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `stream`: Stream keys, stream types and symbol normalization
//!   - `subscription`: Bidirectional subscriber ↔ key book
//!   - `summary`: Feed message classification and summary projection
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Upstream feed and summary cache interfaces
//!   - `services`: Registry, connectors, fan-out router, projector
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `binance`: Upstream WebSocket feed
//!   - `broadcast`: Bounded per-subscriber delivery channels
//!   - `cache`: Redis and in-memory summary caches
//!   - `server`: Downstream WebSocket sessions
//!   - `health`: Health check and metrics HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!                      ┌──────────────┐    raw     ┌──────────┐
//! Exchange WS ───────► │  Connector   │──────────► │  Router  │──► stream sessions
//! (one per key)        │ (per key)    │            │          │
//!                      └──────┬───────┘            │          │──► summary sessions
//!                             │ parsed             └────▲─────┘
//!                             ▼                         │
//!                      ┌──────────────┐   summary       │
//!                      │  Projector   │─────────────────┘
//!                      └──────┬───────┘
//!                             ▼
//!                        summary cache
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core relay types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::stream::{KlineInterval, StreamKey, StreamKeyError, StreamType, Symbol};
pub use domain::subscription::{SubscriberId, SubscriptionBook, SubscriptionStats};
pub use domain::summary::{FeedMessage, SummaryRecord};

// Ports
pub use application::ports::{
    CacheError, FeedError, FeedFrame, FeedSource, FeedStream, SummaryCache,
};

// Relay core
pub use application::services::{
    ConnectorSnapshot, ConnectorState, FanoutRouter, Relay, RelaySettings, SubscriptionRegistry,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, RelayConfig};

// Adapters
pub use infrastructure::binance::BinanceFeed;
pub use infrastructure::broadcast::{OutboundFrame, SendOutcome, SubscriberHandle};
pub use infrastructure::cache::{InMemoryCache, RedisCache, cache_from_url};

// Servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::server::{AppState, ServerError, WsServer};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
