// Core Type Definitions for Depth Sync
// Shared enums and symbol/stream naming helpers

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Side of the book a price level belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookSide {
    Bid,
    Ask,
}

impl fmt::Display for BookSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookSide::Bid => write!(f, "BID"),
            BookSide::Ask => write!(f, "ASK"),
        }
    }
}

/// How consecutive diff-depth events are checked for continuity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceRule {
    /// `U` must not exceed the book's last update id + 1 (spot semantics)
    #[default]
    FirstUpdateId,
    /// After the first applied event, `pu` must equal the book's last update id
    /// (futures `@depth` frames aggregate many updates)
    PreviousFinalId,
}

impl fmt::Display for SequenceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceRule::FirstUpdateId => write!(f, "first_update_id"),
            SequenceRule::PreviousFinalId => write!(f, "previous_final_id"),
        }
    }
}

// ============================================================================
// Symbol helpers
// ============================================================================

/// Registry key for a symbol: trimmed, lowercase ("btcusdt")
pub fn symbol_key(symbol: &str) -> String {
    symbol.trim().to_lowercase()
}

/// Diff depth stream name for a symbol ("btcusdt@depth")
pub fn depth_stream_name(symbol: &str) -> String {
    format!("{}@depth", symbol_key(symbol))
}

/// Symbol as the REST API expects it ("BTCUSDT")
pub fn rest_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}
