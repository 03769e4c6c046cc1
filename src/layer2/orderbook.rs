// Order Book Snapshot - authoritative per-symbol book state
// Exact decimal-string storage, sequence checks and diff application

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::core::types::{BookSide, SequenceRule};
use crate::layer2::parser::{DepthUpdateEvent, PriceLevel};

/// Price text -> quantity text, exactly as the exchange sent them
pub type PriceLevels = HashMap<String, String>;

/// Result of checking a diff event against the book's watermark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Already covered by the book (`u <= last_update_id`)
    Stale,
    /// Events were missed between the book and this one
    Gap { expected: u64, got: u64 },
    Contiguous,
}

/// Result of applying a diff event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    Stale,
    Gap { expected: u64, got: u64 },
    Applied,
}

/// Point-in-time book for one symbol. Storage is unordered; ordering is the
/// projection's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub last_update_id: u64,
    pub bids: PriceLevels,
    pub asks: PriceLevels,
    pub timestamp: u64,
}

impl fmt::Display for OrderBookSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OrderBookSnapshot({} id={}, bids={}, asks={})",
            self.symbol,
            self.last_update_id,
            self.bids.len(),
            self.asks.len()
        )
    }
}

/// True for any decimal spelling of zero ("0", "0.000")
pub fn is_zero_quantity(quantity: &str) -> bool {
    Decimal::from_str(quantity).map(|d| d.is_zero()).unwrap_or(false)
}

fn apply_levels(book_side: &mut PriceLevels, levels: &[PriceLevel]) {
    for level in levels {
        if is_zero_quantity(&level.quantity) {
            book_side.remove(&level.price);
        } else {
            book_side.insert(level.price.clone(), level.quantity.clone());
        }
    }
}

impl OrderBookSnapshot {
    pub fn new(symbol: &str, last_update_id: u64, timestamp: u64) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            last_update_id,
            bids: HashMap::new(),
            asks: HashMap::new(),
            timestamp,
        }
    }

    /// Build from REST levels. Zero-quantity levels are not stored.
    pub fn from_levels(
        symbol: &str,
        last_update_id: u64,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        timestamp: u64,
    ) -> Self {
        let mut snapshot = Self::new(symbol, last_update_id, timestamp);
        apply_levels(&mut snapshot.bids, bids);
        apply_levels(&mut snapshot.asks, asks);
        snapshot
    }

    pub fn side(&self, side: BookSide) -> &PriceLevels {
        match side {
            BookSide::Bid => &self.bids,
            BookSide::Ask => &self.asks,
        }
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    /// Classify `update` against this book.
    ///
    /// `bridged` is true once at least one event has been applied on top of
    /// the REST snapshot; only then does the `pu` link apply.
    pub fn check_sequence(&self, update: &DepthUpdateEvent, rule: SequenceRule, bridged: bool) -> SequenceCheck {
        if update.final_update_id <= self.last_update_id {
            return SequenceCheck::Stale;
        }

        if rule == SequenceRule::PreviousFinalId && bridged {
            if let Some(prev) = update.prev_final_update_id {
                return if prev == self.last_update_id {
                    SequenceCheck::Contiguous
                } else {
                    SequenceCheck::Gap {
                        expected: self.last_update_id,
                        got: prev,
                    }
                };
            }
        }

        let expected = self.last_update_id.saturating_add(1);
        if update.first_update_id > expected {
            return SequenceCheck::Gap {
                expected,
                got: update.first_update_id,
            };
        }

        SequenceCheck::Contiguous
    }

    /// Apply bids then asks, then advance the watermark. No sequence check.
    pub fn apply_update(&mut self, update: &DepthUpdateEvent) {
        apply_levels(&mut self.bids, &update.bids);
        apply_levels(&mut self.asks, &update.asks);
        self.last_update_id = update.final_update_id;
        self.timestamp = update.event_time;
    }

    /// Check and, when contiguous, apply `update`
    pub fn apply(&mut self, update: &DepthUpdateEvent, rule: SequenceRule, bridged: bool) -> ApplyResult {
        match self.check_sequence(update, rule, bridged) {
            SequenceCheck::Stale => ApplyResult::Stale,
            SequenceCheck::Gap { expected, got } => ApplyResult::Gap { expected, got },
            SequenceCheck::Contiguous => {
                self.apply_update(update);
                ApplyResult::Applied
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(first: u64, last: u64, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> DepthUpdateEvent {
        DepthUpdateEvent {
            symbol: "BTCUSDT".to_string(),
            first_update_id: first,
            final_update_id: last,
            prev_final_update_id: None,
            event_time: 1_000 + last,
            bids: bids.iter().map(|(p, q)| PriceLevel::new(p, q)).collect(),
            asks: asks.iter().map(|(p, q)| PriceLevel::new(p, q)).collect(),
        }
    }

    fn book() -> OrderBookSnapshot {
        OrderBookSnapshot::from_levels(
            "btcusdt",
            100,
            &[PriceLevel::new("50000.00", "1.0"), PriceLevel::new("49999.00", "2.0")],
            &[PriceLevel::new("50001.00", "1.5")],
            1,
        )
    }

    #[test]
    fn test_snapshot_from_levels() {
        let ob = book();
        assert_eq!(ob.symbol, "BTCUSDT");
        assert_eq!(ob.bid_levels(), 2);
        assert_eq!(ob.ask_levels(), 1);
        assert_eq!(ob.side(BookSide::Ask).get("50001.00").map(String::as_str), Some("1.5"));
    }

    #[test]
    fn test_zero_quantity_spellings() {
        assert!(is_zero_quantity("0"));
        assert!(is_zero_quantity("0.000"));
        assert!(is_zero_quantity("0.00000000"));
        assert!(!is_zero_quantity("0.001"));
    }

    #[test]
    fn test_differential_update() {
        let mut ob = book();
        let diff = update(
            101,
            103,
            &[("50000.00", "2.0"), ("49998.00", "0.5")],
            &[("50001.00", "0.000"), ("50002.00", "3.0")],
        );

        assert_eq!(ob.apply(&diff, SequenceRule::FirstUpdateId, false), ApplyResult::Applied);
        assert_eq!(ob.last_update_id, 103);
        assert_eq!(ob.timestamp, 1_103);
        assert_eq!(ob.bids.get("50000.00").map(String::as_str), Some("2.0"));
        assert_eq!(ob.bid_levels(), 3);
        assert!(!ob.asks.contains_key("50001.00"));
        assert_eq!(ob.ask_levels(), 1);
    }

    #[test]
    fn test_removing_absent_level_is_noop() {
        let mut ob = book();
        ob.apply(&update(101, 101, &[("1.00", "0")], &[]), SequenceRule::FirstUpdateId, false);
        assert_eq!(ob.bid_levels(), 2);
        assert_eq!(ob.last_update_id, 101);
    }

    #[test]
    fn test_stale_update_changes_nothing() {
        let mut ob = book();
        let before = ob.clone();
        let stale = update(90, 100, &[("50000.00", "9.0")], &[]);
        assert_eq!(ob.apply(&stale, SequenceRule::FirstUpdateId, false), ApplyResult::Stale);
        assert_eq!(ob, before);
    }

    #[test]
    fn test_overlapping_first_update_is_applied() {
        // Snapshot 100 sits inside [95, 105]
        let mut ob = book();
        assert_eq!(
            ob.apply(&update(95, 105, &[], &[]), SequenceRule::FirstUpdateId, false),
            ApplyResult::Applied
        );
        assert_eq!(ob.last_update_id, 105);
    }

    #[test]
    fn test_gap_detected() {
        let mut ob = book();
        let before = ob.clone();
        assert_eq!(
            ob.apply(&update(103, 104, &[], &[]), SequenceRule::FirstUpdateId, false),
            ApplyResult::Gap { expected: 101, got: 103 }
        );
        assert_eq!(ob, before);
    }

    #[test]
    fn test_previous_final_id_rule() {
        let mut ob = book();
        let mut first = update(95, 110, &[], &[]);
        first.prev_final_update_id = Some(94);
        // First event over a snapshot uses the U/u window
        assert_eq!(ob.apply(&first, SequenceRule::PreviousFinalId, false), ApplyResult::Applied);

        let mut next = update(130, 140, &[], &[]);
        next.prev_final_update_id = Some(110);
        assert_eq!(ob.apply(&next, SequenceRule::PreviousFinalId, true), ApplyResult::Applied);

        let mut broken = update(141, 150, &[], &[]);
        broken.prev_final_update_id = Some(139);
        assert_eq!(
            ob.apply(&broken, SequenceRule::PreviousFinalId, true),
            ApplyResult::Gap { expected: 140, got: 139 }
        );
    }

    #[test]
    fn test_first_update_id_rule_ignores_pu() {
        let mut ob = book();
        let mut ev = update(101, 105, &[], &[]);
        ev.prev_final_update_id = Some(42);
        assert_eq!(ob.apply(&ev, SequenceRule::FirstUpdateId, true), ApplyResult::Applied);
    }
}
