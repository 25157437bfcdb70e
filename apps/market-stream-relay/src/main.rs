//! Market Stream Relay Binary
//!
//! Starts the relay.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-stream-relay
//! ```
//!
//! # Environment Variables
//!
//! - `RELAY_WS_PORT`: Downstream WebSocket port (default: 8000)
//! - `RELAY_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `RELAY_UPSTREAM_URL`: Exchange stream base URL (default: wss://stream.binance.com:9443/ws)
//! - `RELAY_RECONNECT_BACKOFF_MS`: Delay between reconnects (default: 3000)
//! - `RELAY_CONNECT_TIMEOUT_SECS`: Upstream connect timeout (default: 10)
//! - `REDIS_URL`: Summary cache; unset uses an in-memory cache
//! - `RELAY_SUMMARY_TTL_SECS`: Summary expiry (default: 5)
//! - `RELAY_CACHE_QUEUE_CAPACITY`: Pending cache writes (default: 1024)
//! - `RELAY_SESSION_BUFFER`: Outbound frames queued per client (default: 1024)
//! - `RELAY_SESSION_PING_SECS`: Client ping interval (default: 30)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `RUST_LOG`: Log filter (default: market_stream_relay=info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_stream_relay::infrastructure::health::{HealthServer, HealthServerState};
use market_stream_relay::infrastructure::server::{AppState, WsServer};
use market_stream_relay::infrastructure::telemetry;
use market_stream_relay::{BinanceFeed, Relay, RelayConfig, cache_from_url, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Upper bound on waiting for servers and connectors to stop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Market Stream Relay");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder unavailable, /metrics disabled");
    }

    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let cache = cache_from_url(config.cache.redis_url.as_deref()).await;
    let feed = Arc::new(BinanceFeed::new(config.upstream.url.clone()));
    let relay = Arc::new(Relay::start(feed, cache, config.relay_settings()));

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&relay),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );

    let app_state = Arc::new(AppState::new(
        Arc::clone(&relay),
        config.session,
        shutdown_token.clone(),
    ));
    let ws_server = WsServer::new(config.server.ws_port, app_state, shutdown_token.clone());

    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let ws_shutdown = shutdown_token.clone();
    let ws_task = tokio::spawn(async move {
        if let Err(e) = ws_server.run().await {
            tracing::error!(error = %e, "WebSocket server error");
            ws_shutdown.cancel();
        }
    });

    tracing::info!("Relay ready");

    await_shutdown(shutdown_token).await;

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = ws_task.await;
        let _ = health_task.await;
        relay.shutdown().await;
    })
    .await;

    if drained.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutdown timed out"
        );
    }

    tracing::info!("Relay stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        ws_port = config.server.ws_port,
        health_port = config.server.health_port,
        cache = if config.cache.redis_url.is_some() { "redis" } else { "memory" },
        "Configuration loaded"
    );
    tracing::debug!(
        upstream_url = %config.upstream.url,
        reconnect_backoff_ms = config.upstream.reconnect_backoff.as_millis(),
        summary_ttl_secs = config.cache.summary_ttl.as_secs(),
        session_buffer = config.session.buffer,
        "Relay settings"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT), or for a server to fail.
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = shutdown_token.cancelled() => {
            tracing::warn!("Server stopped, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
