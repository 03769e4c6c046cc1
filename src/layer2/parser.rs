// Message Parser - Binance futures depth frames
// Stream frames (depth diffs, subscription acks, exchange errors) and REST depth snapshots

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::core::types::rest_symbol;
use crate::layer2::orderbook::OrderBookSnapshot;

// ============================================================================
// Price/Quantity Level
// ============================================================================

/// A price level [price, quantity], kept as the exchange's decimal text
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceLevel {
    pub price: String,
    pub quantity: String,
}

impl PriceLevel {
    pub fn new(price: &str, quantity: &str) -> Self {
        Self {
            price: price.to_string(),
            quantity: quantity.to_string(),
        }
    }
}

/// Check that a string field is a plain decimal number
fn validate_decimal_field(value: &str, field_name: &str) -> Result<(), ParseError> {
    Decimal::from_str(value)
        .map(|_| ())
        .map_err(|_| ParseError::ValidationFailed(format!("Invalid {}: '{}'", field_name, value)))
}

/// Parse a Binance [price_string, qty_string] pair into PriceLevel
fn parse_level(raw: &[String; 2]) -> Result<PriceLevel, ParseError> {
    validate_decimal_field(&raw[0], "price")?;
    validate_decimal_field(&raw[1], "quantity")?;
    Ok(PriceLevel {
        price: raw[0].clone(),
        quantity: raw[1].clone(),
    })
}

fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<PriceLevel>, ParseError> {
    raw.iter().map(parse_level).collect()
}

// ============================================================================
// Parsed Message Types
// ============================================================================

/// One diff-depth event from the `<symbol>@depth` stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepthUpdateEvent {
    pub symbol: String,
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub prev_final_update_id: Option<u64>,
    pub event_time: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Everything a depth stream connection can deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    DepthUpdate(DepthUpdateEvent),
    /// Response to a SUBSCRIBE/UNSUBSCRIBE request
    SubscriptionAck { id: Option<u64> },
    /// Error object returned by the exchange
    ExchangeError { code: i64, message: String },
}

// ============================================================================
// Serde Structures (Raw Binance JSON)
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawDepthUpdate {
    #[serde(rename = "e")]
    _event_type: String,
    #[serde(rename = "E")]
    event_time: u64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "pu", default)]
    prev_final_update_id: Option<u64>,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct RawDepthSnapshot {
    #[serde(rename = "lastUpdateId", default)]
    last_update_id: Option<u64>,
    #[serde(rename = "E", default)]
    event_time: Option<u64>,
    #[serde(default)]
    bids: Option<Vec<[String; 2]>>,
    #[serde(default)]
    asks: Option<Vec<[String; 2]>>,
}

#[derive(Debug, Deserialize)]
struct RawExchangeError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

// ============================================================================
// Errors
// ============================================================================

/// Parser error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    InvalidJson(String),
    UnknownEventType(String),
    ValidationFailed(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::InvalidJson(e) => write!(f, "Invalid JSON: {}", e),
            ParseError::UnknownEventType(e) => write!(f, "Unknown event type: {}", e),
            ParseError::ValidationFailed(e) => write!(f, "Validation failed: {}", e),
        }
    }
}

impl std::error::Error for ParseError {}

// ============================================================================
// MessageParser - Stateful parser with stats
// ============================================================================

/// Parser statistics
#[derive(Debug, Clone, Default)]
pub struct ParserStats {
    pub messages_parsed: u64,
    pub parse_errors: u64,
    pub depth_count: u64,
    pub ack_count: u64,
    pub exchange_errors: u64,
}

impl ParserStats {
    pub fn error_rate(&self) -> f64 {
        let total = self.messages_parsed + self.parse_errors;
        if total > 0 {
            self.parse_errors as f64 / total as f64
        } else {
            0.0
        }
    }
}

/// Frame parser owned by the transport connection
#[derive(Debug, Default)]
pub struct MessageParser {
    pub stats: ParserStats,
}

impl MessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one text frame (combined-stream wrapper or raw payload)
    pub fn parse(&mut self, raw_json: &str) -> Result<StreamFrame, ParseError> {
        let result = parse_frame(raw_json);
        match &result {
            Ok(StreamFrame::DepthUpdate(_)) => {
                self.stats.messages_parsed += 1;
                self.stats.depth_count += 1;
            }
            Ok(StreamFrame::SubscriptionAck { .. }) => {
                self.stats.messages_parsed += 1;
                self.stats.ack_count += 1;
            }
            Ok(StreamFrame::ExchangeError { .. }) => {
                self.stats.messages_parsed += 1;
                self.stats.exchange_errors += 1;
            }
            Err(e) => {
                self.stats.parse_errors += 1;
                debug!(error = %e, "Frame parse failed");
            }
        }
        result
    }

    /// Reset all statistics
    pub fn reset_stats(&mut self) {
        self.stats = ParserStats::default();
    }
}

// ============================================================================
// Standalone parse functions
// ============================================================================

/// Parse a stream frame without stateful tracking
pub fn parse_frame(raw_json: &str) -> Result<StreamFrame, ParseError> {
    let value: serde_json::Value =
        serde_json::from_str(raw_json).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    // Unwrap combined stream format: {"stream": "...", "data": {...}}
    let data = match value.get("data") {
        Some(inner) if value.get("stream").is_some() => inner,
        _ => &value,
    };

    if let Some(error) = data.get("error") {
        let raw: RawExchangeError = serde_json::from_value(error.clone())
            .map_err(|e| ParseError::InvalidJson(e.to_string()))?;
        return Ok(StreamFrame::ExchangeError {
            code: raw.code,
            message: raw.msg,
        });
    }

    if data.get("result").is_some() && data.get("id").is_some() {
        return Ok(StreamFrame::SubscriptionAck {
            id: data.get("id").and_then(|v| v.as_u64()),
        });
    }

    let event_type = data
        .get("e")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ParseError::InvalidJson("Missing event type 'e'".into()))?;

    match event_type {
        "depthUpdate" => parse_depth_update_value(data).map(StreamFrame::DepthUpdate),
        other => Err(ParseError::UnknownEventType(other.to_string())),
    }
}

fn parse_depth_update_value(value: &serde_json::Value) -> Result<DepthUpdateEvent, ParseError> {
    let raw: RawDepthUpdate = serde_json::from_value(value.clone())
        .map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    if raw.first_update_id > raw.final_update_id {
        return Err(ParseError::ValidationFailed(format!(
            "U {} greater than u {}",
            raw.first_update_id, raw.final_update_id
        )));
    }

    Ok(DepthUpdateEvent {
        symbol: raw.symbol,
        first_update_id: raw.first_update_id,
        final_update_id: raw.final_update_id,
        prev_final_update_id: raw.prev_final_update_id,
        event_time: raw.event_time,
        bids: parse_levels(&raw.bids)?,
        asks: parse_levels(&raw.asks)?,
    })
}

/// Parse a REST `/fapi/v1/depth` body into a snapshot for `symbol`
pub fn parse_depth_snapshot(symbol: &str, raw_json: &str) -> Result<OrderBookSnapshot, ParseError> {
    let upper = rest_symbol(symbol);
    let raw: RawDepthSnapshot =
        serde_json::from_str(raw_json).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    let invalid = || ParseError::ValidationFailed(format!("Invalid snapshot data received for {}.", upper));

    let last_update_id = raw.last_update_id.ok_or_else(invalid)?;
    let bids = parse_levels(raw.bids.as_deref().ok_or_else(invalid)?)?;
    let asks = parse_levels(raw.asks.as_deref().ok_or_else(invalid)?)?;
    let timestamp = raw.event_time.unwrap_or_else(now_ms);

    Ok(OrderBookSnapshot::from_levels(&upper, last_update_id, &bids, &asks, timestamp))
}

/// Get current timestamp in milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
