//! Relay Configuration Settings
//!
//! Configuration types for the relay, loaded from environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `RELAY_WS_PORT` | `8000` |
//! | `RELAY_HEALTH_PORT` | `8082` |
//! | `RELAY_UPSTREAM_URL` | `wss://stream.binance.com:9443/ws` |
//! | `RELAY_RECONNECT_BACKOFF_MS` | `3000` |
//! | `RELAY_CONNECT_TIMEOUT_SECS` | `10` |
//! | `REDIS_URL` | unset (in-memory cache) |
//! | `RELAY_SUMMARY_TTL_SECS` | `5` |
//! | `RELAY_CACHE_QUEUE_CAPACITY` | `1024` |
//! | `RELAY_SESSION_BUFFER` | `1024` |
//! | `RELAY_SESSION_PING_SECS` | `30` |

use std::str::FromStr;
use std::time::Duration;

use crate::application::services::connector::{ConnectorSettings, DEFAULT_CONNECT_TIMEOUT};
use crate::application::services::reconnect::{DEFAULT_BACKOFF, ReconnectConfig};
use crate::application::services::relay::{
    DEFAULT_CACHE_QUEUE_CAPACITY, DEFAULT_SUMMARY_TTL, RelaySettings,
};
use crate::infrastructure::binance::DEFAULT_BASE_URL;

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Downstream WebSocket port.
    pub ws_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ws_port: 8000,
            health_port: 8082,
        }
    }
}

/// Upstream exchange connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSettings {
    /// Base URL for raw streams.
    pub url: String,
    /// Delay between reconnection attempts.
    pub reconnect_backoff: Duration,
    /// Upper bound on one connection attempt.
    pub connect_timeout: Duration,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_BASE_URL.to_string(),
            reconnect_backoff: DEFAULT_BACKOFF,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Summary cache settings.
#[derive(Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Redis connection URL; `None` selects the in-memory cache.
    pub redis_url: Option<String>,
    /// Expiry of cached summaries.
    pub summary_ttl: Duration,
    /// Capacity of the cache write queue.
    pub queue_capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            summary_ttl: DEFAULT_SUMMARY_TTL,
            queue_capacity: DEFAULT_CACHE_QUEUE_CAPACITY,
        }
    }
}

impl std::fmt::Debug for CacheSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSettings")
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .field("summary_ttl", &self.summary_ttl)
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

/// Downstream session settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Outbound queue capacity per session.
    pub buffer: usize,
    /// Interval between server pings.
    pub ping_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            buffer: 1024,
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayConfig {
    /// Server port settings.
    pub server: ServerSettings,
    /// Upstream connection settings.
    pub upstream: UpstreamSettings,
    /// Summary cache settings.
    pub cache: CacheSettings,
    /// Downstream session settings.
    pub session: SessionSettings,
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// Unset and blank variables take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an invalid value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let defaults = Self::default();

        let server = ServerSettings {
            ws_port: env.parse("RELAY_WS_PORT", defaults.server.ws_port)?,
            health_port: env.parse("RELAY_HEALTH_PORT", defaults.server.health_port)?,
        };

        let url = env
            .get("RELAY_UPSTREAM_URL")
            .unwrap_or(defaults.upstream.url);
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_UPSTREAM_URL".to_string(),
                value: url,
            });
        }

        let upstream = UpstreamSettings {
            url,
            reconnect_backoff: env.millis(
                "RELAY_RECONNECT_BACKOFF_MS",
                defaults.upstream.reconnect_backoff,
            )?,
            connect_timeout: env.secs(
                "RELAY_CONNECT_TIMEOUT_SECS",
                defaults.upstream.connect_timeout,
            )?,
        };

        let cache = CacheSettings {
            redis_url: env.get("REDIS_URL"),
            summary_ttl: env.secs("RELAY_SUMMARY_TTL_SECS", defaults.cache.summary_ttl)?,
            queue_capacity: env.parse(
                "RELAY_CACHE_QUEUE_CAPACITY",
                defaults.cache.queue_capacity,
            )?,
        };

        let session = SessionSettings {
            buffer: env.parse("RELAY_SESSION_BUFFER", defaults.session.buffer)?,
            ping_interval: env.secs("RELAY_SESSION_PING_SECS", defaults.session.ping_interval)?,
        };

        Ok(Self {
            server,
            upstream,
            cache,
            session,
        })
    }

    /// Settings for the relay core.
    #[must_use]
    pub const fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            connector: ConnectorSettings {
                reconnect: ReconnectConfig::fixed(self.upstream.reconnect_backoff),
                connect_timeout: self.upstream.connect_timeout,
            },
            summary_ttl: self.cache.summary_ttl,
            cache_queue_capacity: self.cache.queue_capacity,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable holds a value that cannot be used.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

/// Variable source with typed accessors.
struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        self.get(key).map_or(Ok(default), |value| {
            value.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            })
        })
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.get(key)
            .map_or(Ok(default), |_| self.parse(key, 0u64).map(Duration::from_secs))
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.get(key)
            .map_or(Ok(default), |_| self.parse(key, 0u64).map(Duration::from_millis))
    }
}
