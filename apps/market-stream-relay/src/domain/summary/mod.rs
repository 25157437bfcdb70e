//! Summary Projection
//!
//! Reduces heterogeneous exchange payloads to a small [`SummaryRecord`]:
//! symbol, last price, volume and a timestamp.
//!
//! # Classification
//!
//! | Shape | Detected by | Price | Volume |
//! |-------|-------------|-------|--------|
//! | Kline | `e == "kline"` or object-valued `k` | `k.c` | `k.v` |
//! | Trade | `e` is `trade` or `aggTrade` | `p` | `q` |
//! | Ticker | any other object with `s` | `c` | `v` |
//!
//! Order book payloads (`depthUpdate`, and `bookTicker` with or without an
//! `e` tag) carry no last price and are left out of the ticker shape.
//! Anything else is [`FeedMessage::Unrecognized`] and produces no record.
//! Numeric fields are accepted as JSON numbers or numeric strings; values that
//! do not parse become `None` rather than failing the message.

use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Prefix for summary cache keys.
pub const CACHE_KEY_PREFIX: &str = "summary:";

/// Cache key holding the latest summary for a symbol.
#[must_use]
pub fn cache_key(symbol: &str) -> String {
    format!("{CACHE_KEY_PREFIX}{}", symbol.trim().to_ascii_lowercase())
}

// =============================================================================
// Summary Record
// =============================================================================

/// Latest-known summary for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    /// Symbol as reported by the exchange (usually uppercase).
    pub symbol: String,
    /// Last traded or close price.
    pub last_price: Option<f64>,
    /// Volume figure carried by the source message.
    pub volume: Option<f64>,
    /// Projection time in Unix milliseconds.
    #[serde(rename = "ts")]
    pub timestamp: i64,
}

/// Outbound wrapper sent to summary subscribers.
#[derive(Serialize)]
struct SummaryEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a SummaryRecord,
}

impl SummaryRecord {
    /// Lowercase symbol used for routing and cache keys.
    #[must_use]
    pub fn routing_symbol(&self) -> String {
        self.symbol.to_ascii_lowercase()
    }

    /// Cache key for this record.
    #[must_use]
    pub fn cache_key(&self) -> String {
        cache_key(&self.symbol)
    }

    /// Serialize as `{"type":"summary","data":{...}}`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_envelope_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&SummaryEnvelope {
            kind: "summary",
            data: self,
        })
    }
}

// =============================================================================
// Lenient Field Parsing
// =============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum Numeric {
    Number(f64),
    Text(String),
    Other(IgnoredAny),
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let parsed = Option::<Numeric>::deserialize(deserializer)?;
    Ok(match parsed {
        Some(Numeric::Number(n)) => Some(n),
        Some(Numeric::Text(s)) => s.trim().parse().ok(),
        Some(Numeric::Other(_)) | None => None,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Text {
    Str(String),
    Other(IgnoredAny),
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let parsed = Option::<Text>::deserialize(deserializer)?;
    Ok(match parsed {
        Some(Text::Str(s)) if !s.trim().is_empty() => Some(s),
        _ => None,
    })
}

// =============================================================================
// Wire Shapes
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct KlineBody {
    #[serde(rename = "s", default, deserialize_with = "lenient_string")]
    symbol: Option<String>,
    #[serde(rename = "c", default, deserialize_with = "lenient_f64")]
    close: Option<f64>,
    #[serde(rename = "v", default, deserialize_with = "lenient_f64")]
    volume: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "s", default, deserialize_with = "lenient_string")]
    symbol: Option<String>,
    #[serde(rename = "k", default)]
    kline: Option<KlineBody>,
}

#[derive(Debug, Deserialize)]
struct TickerPayload {
    #[serde(rename = "s", default, deserialize_with = "lenient_string")]
    symbol: Option<String>,
    #[serde(rename = "c", default, deserialize_with = "lenient_f64")]
    close: Option<f64>,
    #[serde(rename = "v", default, deserialize_with = "lenient_f64")]
    volume: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TradePayload {
    #[serde(rename = "s", default, deserialize_with = "lenient_string")]
    symbol: Option<String>,
    #[serde(rename = "p", default, deserialize_with = "lenient_f64")]
    price: Option<f64>,
    #[serde(rename = "q", default, deserialize_with = "lenient_f64")]
    quantity: Option<f64>,
}

// =============================================================================
// Feed Message
// =============================================================================

/// Fields extracted from a recognized message.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    /// Symbol as carried by the message.
    pub symbol: String,
    /// Price field.
    pub price: Option<f64>,
    /// Volume or quantity field.
    pub volume: Option<f64>,
}

/// Classified exchange payload.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// Candlestick update.
    Kline(Extracted),
    /// 24h ticker or mini ticker.
    Ticker(Extracted),
    /// Trade or aggregate trade.
    Trade(Extracted),
    /// Anything without a usable symbol.
    Unrecognized,
}

impl FeedMessage {
    /// Classify a decoded JSON payload.
    #[must_use]
    pub fn classify(value: &Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self::Unrecognized;
        };

        let event = object.get("e").and_then(Value::as_str);
        let has_kline_body = object.get("k").is_some_and(Value::is_object);

        if has_kline_body || event == Some("kline") {
            return KlinePayload::deserialize(value).map_or(Self::Unrecognized, |payload| {
                let body = payload.kline.unwrap_or_default();
                payload
                    .symbol
                    .or(body.symbol)
                    .map_or(Self::Unrecognized, |symbol| {
                        Self::Kline(Extracted {
                            symbol,
                            price: body.close,
                            volume: body.volume,
                        })
                    })
            });
        }

        if is_order_book(object, event) {
            return Self::Unrecognized;
        }

        if matches!(event, Some("trade" | "aggTrade")) {
            return TradePayload::deserialize(value).map_or(Self::Unrecognized, |payload| {
                payload.symbol.map_or(Self::Unrecognized, |symbol| {
                    Self::Trade(Extracted {
                        symbol,
                        price: payload.price,
                        volume: payload.quantity,
                    })
                })
            });
        }

        TickerPayload::deserialize(value).map_or(Self::Unrecognized, |payload| {
            payload.symbol.map_or(Self::Unrecognized, |symbol| {
                Self::Ticker(Extracted {
                    symbol,
                    price: payload.close,
                    volume: payload.volume,
                })
            })
        })
    }

    /// Extracted fields, if the message was recognized.
    #[must_use]
    pub const fn extracted(&self) -> Option<&Extracted> {
        match self {
            Self::Kline(e) | Self::Ticker(e) | Self::Trade(e) => Some(e),
            Self::Unrecognized => None,
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Kline(_) => "kline",
            Self::Ticker(_) => "ticker",
            Self::Trade(_) => "trade",
            Self::Unrecognized => "unrecognized",
        }
    }

    /// Build a summary record stamped at `timestamp` (Unix millis).
    #[must_use]
    pub fn into_record(self, timestamp: i64) -> Option<SummaryRecord> {
        match self {
            Self::Kline(e) | Self::Ticker(e) | Self::Trade(e) => Some(SummaryRecord {
                symbol: e.symbol,
                last_price: e.price,
                volume: e.volume,
                timestamp,
            }),
            Self::Unrecognized => None,
        }
    }
}

/// Depth diffs and best bid/ask updates. Spot `bookTicker` frames have no
/// `e` field, only `b`/`a` quotes.
fn is_order_book(object: &serde_json::Map<String, Value>, event: Option<&str>) -> bool {
    match event {
        Some(event) => matches!(event, "depthUpdate" | "bookTicker"),
        None => object.contains_key("b") && object.contains_key("a") && !object.contains_key("c"),
    }
}

/// Project a decoded payload to a summary record.
///
/// Returns `None` when the payload carries no symbol.
#[must_use]
pub fn project(value: &Value, timestamp: i64) -> Option<SummaryRecord> {
    FeedMessage::classify(value).into_record(timestamp)
}

// =============================================================================
// Tests
// =============================================================================
