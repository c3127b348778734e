//! Turns one raw source message into zero or more [`Tick`]s. Unknown
//! fields are ignored (`serde(default)` + permissive aliases); a message
//! that matches neither known shape is a parse error, counted upstream.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

use crate::models::Tick;

/// Generic tick payload, as produced by a JSON REST source or file fixture.
#[derive(Debug, Deserialize)]
struct GenericTickPayload {
    #[serde(alias = "s")]
    symbol: String,
    #[serde(alias = "p")]
    price: f64,
    #[serde(alias = "b", default)]
    bid: Option<f64>,
    #[serde(alias = "a", default)]
    ask: Option<f64>,
    #[serde(alias = "v", alias = "q", default)]
    volume: f64,
    #[serde(alias = "t", default)]
    timestamp_ms: Option<i64>,
}

/// Binance-style combined-stream bookTicker frame:
/// `{"stream": "...", "data": {"s": "...", "b": "...", "a": "..."}}`.
#[derive(Debug, Deserialize)]
struct CombinedStreamEnvelope {
    data: BookTickerPayload,
}

#[derive(Debug, Deserialize)]
struct BookTickerPayload {
    s: String,
    #[serde(alias = "b")]
    bid: String,
    #[serde(alias = "a")]
    ask: String,
}

pub fn parse_message(raw: &str, source: &str) -> Result<Vec<Tick>, String> {
    if let Ok(envelope) = serde_json::from_str::<CombinedStreamEnvelope>(raw) {
        let bid: f64 = envelope
            .data
            .bid
            .parse()
            .map_err(|_| "malformed bid".to_string())?;
        let ask: f64 = envelope
            .data
            .ask
            .parse()
            .map_err(|_| "malformed ask".to_string())?;
        return Ok(vec![Tick {
            symbol: envelope.data.s,
            price: (bid + ask) / 2.0,
            bid: Some(bid),
            ask: Some(ask),
            volume: 0.0,
            timestamp: Utc::now(),
            source: source.to_string(),
            latency: Duration::ZERO,
        }]);
    }

    if let Ok(payload) = serde_json::from_str::<GenericTickPayload>(raw) {
        let timestamp = payload
            .timestamp_ms
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);
        return Ok(vec![Tick {
            symbol: payload.symbol,
            price: payload.price,
            bid: payload.bid,
            ask: payload.ask,
            volume: payload.volume,
            timestamp,
            source: source.to_string(),
            latency: Duration::ZERO,
        }]);
    }

    Err("unrecognized message shape".to_string())
}

/// Binance-style combined-stream subscribe frame for the given symbol,
/// or `None` for sources that auto-subscribe on connect.
pub fn subscribe_payload(symbol: &str) -> Option<String> {
    Some(
        serde_json::json!({
            "method": "SUBSCRIBE",
            "params": [format!("{}@bookTicker", symbol.to_lowercase())],
            "id": 1,
        })
        .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_combined_stream_book_ticker() {
        let raw = r#"{"stream":"btcusdt@bookTicker","data":{"s":"BTCUSDT","b":"100.0","B":"1","a":"101.0","A":"1"}}"#;
        let ticks = parse_message(raw, "binance").unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].symbol, "BTCUSDT");
        assert!((ticks[0].price - 100.5).abs() < 1e-9);
    }

    #[test]
    fn parses_generic_payload() {
        let raw = r#"{"symbol":"ETHUSDT","price":2500.5,"volume":10.0,"t":1700000000000}"#;
        let ticks = parse_message(raw, "rest-feed").unwrap();
        assert_eq!(ticks[0].symbol, "ETHUSDT");
        assert_eq!(ticks[0].volume, 10.0);
    }

    #[test]
    fn rejects_unrecognized_payload() {
        assert!(parse_message(r#"{"garbage": true}"#, "x").is_err());
    }
}
