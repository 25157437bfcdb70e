//! Client Control Protocol
//!
//! JSON control messages sent by downstream clients, and the query
//! parameters that select a session's initial subscriptions.
//!
//! ```json
//! { "action": "subscribe",   "symbols": ["BTCUSDT"] }
//! { "action": "unsubscribe", "symbols": ["BTCUSDT"] }
//! { "action": "replace",     "symbols": ["ETHUSDT"], "stream_type": "kline_1m" }
//! ```

use serde::Deserialize;

use crate::domain::stream::{StreamKey, StreamKeyError, StreamType, Symbol, normalize_symbol};

/// Default symbol for raw sessions.
pub const DEFAULT_SYMBOL: &str = "btcusdt";

/// Default stream type for raw sessions.
pub const DEFAULT_STREAM_TYPE: &str = "ticker";

/// Default symbol list for summary sessions.
pub const DEFAULT_SUMMARY_SYMBOLS: &str = "BTCUSDT";

// =============================================================================
// Control Messages
// =============================================================================

/// Control action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Add subscriptions.
    Subscribe,
    /// Remove subscriptions.
    Unsubscribe,
    /// Swap the whole subscription set.
    Replace,
}

impl std::str::FromStr for ControlAction {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscribe" => Ok(Self::Subscribe),
            "unsubscribe" => Ok(Self::Unsubscribe),
            "replace" => Ok(Self::Replace),
            other => Err(ControlError::UnknownAction(other.to_string())),
        }
    }
}

#[derive(Deserialize)]
struct RawControl {
    action: String,
    #[serde(default)]
    symbols: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    stream_type: Option<String>,
}

/// Decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    /// Requested action.
    pub action: ControlAction,
    /// Normalized symbols. Blank, invalid and non-string entries are dropped.
    pub symbols: Vec<Symbol>,
    /// Stream type override for raw sessions.
    pub stream_type: Option<StreamType>,
}

impl ControlMessage {
    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON, an unknown action or an
    /// unparseable stream type.
    pub fn parse(text: &str) -> Result<Self, ControlError> {
        let raw: RawControl =
            serde_json::from_str(text).map_err(|e| ControlError::Malformed(e.to_string()))?;

        let action = raw.action.parse()?;
        let stream_type = raw
            .stream_type
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse::<StreamType>)
            .transpose()
            .map_err(|e| ControlError::InvalidStreamType(e.to_string()))?;

        let symbols = dedup(
            raw.symbols
                .iter()
                .flatten()
                .filter_map(serde_json::Value::as_str)
                .filter_map(|s| normalize_symbol(s).ok()),
        );

        Ok(Self {
            action,
            symbols,
            stream_type,
        })
    }
}

fn dedup(symbols: impl Iterator<Item = Symbol>) -> Vec<Symbol> {
    let mut out: Vec<Symbol> = Vec::new();
    for symbol in symbols {
        if !out.contains(&symbol) {
            out.push(symbol);
        }
    }
    out
}

// =============================================================================
// Connection Parameters
// =============================================================================

/// Query parameters for raw-stream sessions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamParams {
    /// Initial symbol.
    pub symbol: Option<String>,
    /// Initial stream type.
    pub stream_type: Option<String>,
}

impl StreamParams {
    /// Initial stream key, applying defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the symbol or stream type is invalid.
    pub fn key(&self) -> Result<StreamKey, StreamKeyError> {
        let symbol = non_blank(self.symbol.as_deref()).unwrap_or(DEFAULT_SYMBOL);
        let stream_type = non_blank(self.stream_type.as_deref()).unwrap_or(DEFAULT_STREAM_TYPE);
        StreamKey::parse(stream_type, symbol)
    }
}

/// Query parameters for summary sessions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SummaryParams {
    /// Comma-separated initial symbols.
    pub symbols: Option<String>,
}

impl SummaryParams {
    /// Initial summary symbols, applying defaults. Blank entries are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a non-blank entry is not a valid symbol.
    pub fn symbols(&self) -> Result<Vec<Symbol>, StreamKeyError> {
        let list = self.symbols.as_deref().unwrap_or(DEFAULT_SUMMARY_SYMBOLS);
        let parsed = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(normalize_symbol)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(dedup(parsed.into_iter()))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

// =============================================================================
// Errors
// =============================================================================

/// Control message decode errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    /// Not a JSON control object.
    #[error("malformed control message: {0}")]
    Malformed(String),

    /// Action is not one of subscribe, unsubscribe or replace.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// Stream type override could not be parsed.
    #[error("invalid stream type: {0}")]
    InvalidStreamType(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::domain::stream::KlineInterval;

    #[test_case(r#"{"action":"subscribe","symbols":["BTCUSDT"]}"#, ControlAction::Subscribe ; "subscribe")]
    #[test_case(r#"{"action":"unsubscribe","symbols":["BTCUSDT"]}"#, ControlAction::Unsubscribe ; "unsubscribe")]
    #[test_case(r#"{"action":"replace","symbols":["BTCUSDT"]}"#, ControlAction::Replace ; "replace")]
    fn parses_actions(text: &str, expected: ControlAction) {
        let message = ControlMessage::parse(text).unwrap();
        assert_eq!(message.action, expected);
        assert_eq!(message.symbols, vec!["btcusdt".to_string()]);
        assert_eq!(message.stream_type, None);
    }

    #[test_case("not json" ; "garbage")]
    #[test_case("[]" ; "array")]
    #[test_case(r#"{"symbols":["BTCUSDT"]}"# ; "missing action")]
    #[test_case(r#"{"action":"subscribe","symbols":"BTCUSDT"}"# ; "symbols not a list")]
    fn rejects_malformed(text: &str) {
        assert!(matches!(
            ControlMessage::parse(text),
            Err(ControlError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_unknown_action() {
        assert_eq!(
            ControlMessage::parse(r#"{"action":"pause","symbols":[]}"#),
            Err(ControlError::UnknownAction("pause".to_string()))
        );
    }

    #[test]
    fn drops_blank_invalid_and_duplicate_symbols() {
        let message = ControlMessage::parse(
            r#"{"action":"subscribe","symbols":["ETHUSDT"," ","btc/usdt","ethusdt"]}"#,
        )
        .unwrap();

        assert_eq!(message.symbols, vec!["ethusdt".to_string()]);
    }

    #[test_case(r#"{"action":"replace"}"# ; "missing")]
    #[test_case(r#"{"action":"replace","symbols":null}"# ; "null")]
    #[test_case(r#"{"action":"replace","symbols":[]}"# ; "empty list")]
    fn absent_symbols_is_empty(text: &str) {
        let message = ControlMessage::parse(text).unwrap();
        assert_eq!(message.action, ControlAction::Replace);
        assert!(message.symbols.is_empty());
    }

    #[test_case(r#"{"action":"subscribe","symbols":["ETHUSDT",null]}"# ; "null entry")]
    #[test_case(r#"{"action":"subscribe","symbols":["ETHUSDT",5]}"# ; "number entry")]
    #[test_case(r#"{"action":"subscribe","symbols":[{"s":"BTCUSDT"},"ETHUSDT",["x"]]}"# ; "nested entries")]
    fn skips_non_string_entries(text: &str) {
        let message = ControlMessage::parse(text).unwrap();
        assert_eq!(message.symbols, vec!["ethusdt".to_string()]);
    }

    #[test]
    fn parses_stream_type_override() {
        let message = ControlMessage::parse(
            r#"{"action":"subscribe","symbols":["BTCUSDT"],"stream_type":"kline_5m"}"#,
        )
        .unwrap();

        assert_eq!(
            message.stream_type,
            Some(StreamType::Kline(KlineInterval::FiveMinutes))
        );
    }

    #[test]
    fn rejects_bad_stream_type_override() {
        assert!(matches!(
            ControlMessage::parse(r#"{"action":"subscribe","symbols":[],"stream_type":"bogus"}"#),
            Err(ControlError::InvalidStreamType(_))
        ));
    }

    #[test]
    fn stream_params_defaults() {
        let key = StreamParams::default().key().unwrap();

        assert_eq!(key.stream_type(), StreamType::Ticker);
        assert_eq!(key.symbol(), "btcusdt");
    }

    #[test]
    fn stream_params_normalize_symbol() {
        let params = StreamParams {
            symbol: Some("ETHUSDT".to_string()),
            stream_type: Some("trades".to_string()),
        };

        let key = params.key().unwrap();

        assert_eq!(key.stream_type(), StreamType::Trades);
        assert_eq!(key.symbol(), "ethusdt");
    }

    #[test]
    fn stream_params_reject_unknown_type() {
        let params = StreamParams {
            symbol: None,
            stream_type: Some("orderbook".to_string()),
        };

        assert!(params.key().is_err());
    }

    #[test_case(None, &["btcusdt"] ; "default")]
    #[test_case(Some("BTCUSDT,ETHUSDT"), &["btcusdt", "ethusdt"] ; "list")]
    #[test_case(Some(" BTCUSDT, ,ETHUSDT,"), &["btcusdt", "ethusdt"] ; "blanks skipped")]
    #[test_case(Some(""), &[] ; "empty")]
    fn summary_params_symbols(raw: Option<&str>, expected: &[&str]) {
        let params = SummaryParams {
            symbols: raw.map(str::to_string),
        };

        assert_eq!(params.symbols().unwrap(), expected);
    }

    #[test]
    fn summary_params_reject_invalid_symbol() {
        let params = SummaryParams {
            symbols: Some("BTCUSDT,eth-usdt".to_string()),
        };

        assert!(params.symbols().is_err());
    }
}
