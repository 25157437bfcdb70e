//! Stream Identity Types
//!
//! A [`StreamKey`] names exactly one upstream exchange stream: a
//! [`StreamType`] plus a lowercase symbol. The key is what the registry
//! reference-counts and what the upstream connector dials.
//!
//! # Upstream Naming
//!
//! Binance addresses raw streams as `{symbol}@{stream}`:
//!
//! ```text
//! btcusdt@ticker      btcusdt@kline_1m      ethusdt@trade
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

/// A normalized (lowercase) trading pair symbol, e.g. `btcusdt`.
pub type Symbol = String;

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while parsing stream identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamKeyError {
    /// The stream type is not one the relay knows how to open.
    #[error("unknown stream type: {0}")]
    UnknownStreamType(String),

    /// The kline interval is not a Binance interval.
    #[error("unknown kline interval: {0}")]
    UnknownInterval(String),

    /// The symbol is empty after trimming.
    #[error("symbol cannot be empty")]
    EmptySymbol,

    /// The symbol contains characters outside `[A-Za-z0-9]`.
    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),
}

// =============================================================================
// Kline Interval
// =============================================================================

/// Candlestick interval for `kline_<interval>` streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KlineInterval {
    /// 1 second.
    OneSecond,
    /// 1 minute.
    OneMinute,
    /// 3 minutes.
    ThreeMinutes,
    /// 5 minutes.
    FiveMinutes,
    /// 15 minutes.
    FifteenMinutes,
    /// 30 minutes.
    ThirtyMinutes,
    /// 1 hour.
    OneHour,
    /// 2 hours.
    TwoHours,
    /// 4 hours.
    FourHours,
    /// 6 hours.
    SixHours,
    /// 8 hours.
    EightHours,
    /// 12 hours.
    TwelveHours,
    /// 1 day.
    OneDay,
    /// 3 days.
    ThreeDays,
    /// 1 week.
    OneWeek,
    /// 1 month.
    OneMonth,
}

impl KlineInterval {
    /// Binance interval token.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneSecond => "1s",
            Self::OneMinute => "1m",
            Self::ThreeMinutes => "3m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::TwoHours => "2h",
            Self::FourHours => "4h",
            Self::SixHours => "6h",
            Self::EightHours => "8h",
            Self::TwelveHours => "12h",
            Self::OneDay => "1d",
            Self::ThreeDays => "3d",
            Self::OneWeek => "1w",
            Self::OneMonth => "1M",
        }
    }
}

impl FromStr for KlineInterval {
    type Err = StreamKeyError;

    /// `1M` is a month and `1m` a minute; every other token is
    /// case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "1M" {
            return Ok(Self::OneMonth);
        }

        match s.to_ascii_lowercase().as_str() {
            "1s" => Ok(Self::OneSecond),
            "1m" => Ok(Self::OneMinute),
            "3m" => Ok(Self::ThreeMinutes),
            "5m" => Ok(Self::FiveMinutes),
            "15m" => Ok(Self::FifteenMinutes),
            "30m" => Ok(Self::ThirtyMinutes),
            "1h" => Ok(Self::OneHour),
            "2h" => Ok(Self::TwoHours),
            "4h" => Ok(Self::FourHours),
            "6h" => Ok(Self::SixHours),
            "8h" => Ok(Self::EightHours),
            "12h" => Ok(Self::TwelveHours),
            "1d" => Ok(Self::OneDay),
            "3d" => Ok(Self::ThreeDays),
            "1w" => Ok(Self::OneWeek),
            _ => Err(StreamKeyError::UnknownInterval(s.to_string())),
        }
    }
}

// =============================================================================
// Stream Type
// =============================================================================

/// Kind of upstream stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    /// Rolling 24h ticker (`24hrTicker` events).
    Ticker,
    /// Rolling 24h mini ticker.
    MiniTicker,
    /// Best bid/ask updates.
    BookTicker,
    /// Raw trades.
    Trades,
    /// Aggregated trades.
    AggTrade,
    /// Diff depth updates.
    Depth,
    /// Partial book depth with 5, 10 or 20 levels.
    PartialDepth(u8),
    /// Candlesticks for an interval.
    Kline(KlineInterval),
}

impl StreamType {
    /// Stream name used in the upstream URL.
    ///
    /// Identical to the canonical name except for [`StreamType::Trades`],
    /// which Binance calls `trade`.
    #[must_use]
    pub fn upstream_name(self) -> String {
        match self {
            Self::Trades => "trade".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether this stream carries candlesticks.
    #[must_use]
    pub const fn is_kline(self) -> bool {
        matches!(self, Self::Kline(_))
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ticker => f.write_str("ticker"),
            Self::MiniTicker => f.write_str("miniTicker"),
            Self::BookTicker => f.write_str("bookTicker"),
            Self::Trades => f.write_str("trades"),
            Self::AggTrade => f.write_str("aggTrade"),
            Self::Depth => f.write_str("depth"),
            Self::PartialDepth(levels) => write!(f, "depth{levels}"),
            Self::Kline(interval) => write!(f, "kline_{}", interval.as_str()),
        }
    }
}

impl FromStr for StreamType {
    type Err = StreamKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();

        // The interval suffix keeps its case so `1M` survives.
        if let Some(interval) = trimmed
            .get(..6)
            .filter(|prefix| prefix.eq_ignore_ascii_case("kline_"))
            .map(|_| &trimmed[6..])
        {
            return interval.parse().map(Self::Kline);
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "ticker" => Ok(Self::Ticker),
            "miniticker" => Ok(Self::MiniTicker),
            "bookticker" => Ok(Self::BookTicker),
            "trades" | "trade" => Ok(Self::Trades),
            "aggtrade" => Ok(Self::AggTrade),
            "depth" => Ok(Self::Depth),
            "depth5" => Ok(Self::PartialDepth(5)),
            "depth10" => Ok(Self::PartialDepth(10)),
            "depth20" => Ok(Self::PartialDepth(20)),
            _ => Err(StreamKeyError::UnknownStreamType(s.to_string())),
        }
    }
}

impl Serialize for StreamType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// =============================================================================
// Symbols
// =============================================================================

/// Normalize a symbol for use as a key.
///
/// # Errors
///
/// Returns an error if the symbol is blank or not ASCII alphanumeric.
pub fn normalize_symbol(raw: &str) -> Result<Symbol, StreamKeyError> {
    let trimmed = raw.trim();

    if trimmed.is_empty() {
        return Err(StreamKeyError::EmptySymbol);
    }

    if !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(StreamKeyError::InvalidSymbol(trimmed.to_string()));
    }

    Ok(trimmed.to_ascii_lowercase())
}

// =============================================================================
// Stream Key
// =============================================================================

/// Identifies one upstream connection: `(stream_type, symbol)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    stream_type: StreamType,
    symbol: Symbol,
}

impl StreamKey {
    /// Create a key, normalizing the symbol to lowercase.
    ///
    /// # Errors
    ///
    /// Returns an error if the symbol is invalid.
    pub fn new(stream_type: StreamType, symbol: &str) -> Result<Self, StreamKeyError> {
        Ok(Self {
            stream_type,
            symbol: normalize_symbol(symbol)?,
        })
    }

    /// Parse a key from raw query parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if either part is invalid.
    pub fn parse(stream_type: &str, symbol: &str) -> Result<Self, StreamKeyError> {
        Self::new(stream_type.parse()?, symbol)
    }

    /// The stream type.
    #[must_use]
    pub const fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    /// The lowercase symbol.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Upstream stream name, `{symbol}@{stream}`.
    #[must_use]
    pub fn stream_name(&self) -> String {
        format!("{}@{}", self.symbol, self.stream_type.upstream_name())
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stream_type, self.symbol)
    }
}

// =============================================================================
// Tests
// =============================================================================
