//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the HTTP surfaces.

/// Binance WebSocket feed adapter.
pub mod binance;

/// Per-subscriber delivery channels.
pub mod broadcast;

/// Summary cache adapters (Redis, in-memory) and the write queue.
pub mod cache;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Downstream WebSocket sessions.
pub mod server;

/// Tracing and OpenTelemetry integration.
pub mod telemetry;
