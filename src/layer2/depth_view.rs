// Depth View - render-ready projection of an order book
// Sorted, depth-limited levels with cumulative size and display formatting

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::core::config::DISPLAY_DEPTH_CHOICES;
use crate::core::types::BookSide;
use crate::layer2::orderbook::OrderBookSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViewError {
    #[error("Unsupported display depth {0}, expected one of {:?}", DISPLAY_DEPTH_CHOICES)]
    UnsupportedDepth(usize),
}

// ============================================================================
// Display depth
// ============================================================================

/// Levels shown per side, restricted to the selectable set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DisplayDepth(usize);

impl DisplayDepth {
    pub const DEFAULT: DisplayDepth = DisplayDepth(15);

    pub fn new(levels: usize) -> Result<Self, ViewError> {
        if DISPLAY_DEPTH_CHOICES.contains(&levels) {
            Ok(Self(levels))
        } else {
            Err(ViewError::UnsupportedDepth(levels))
        }
    }

    pub fn levels(self) -> usize {
        self.0
    }
}

impl Default for DisplayDepth {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<usize> for DisplayDepth {
    type Error = ViewError;

    fn try_from(levels: usize) -> Result<Self, Self::Error> {
        Self::new(levels)
    }
}

impl fmt::Display for DisplayDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Projection
// ============================================================================

/// One displayed row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepthLevel {
    pub price: Decimal,
    pub quantity: Decimal,
    /// Sum of quantities from the best level through this one
    pub cumulative: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderBookView {
    pub symbol: String,
    pub last_update_id: u64,
    pub timestamp: u64,
    pub depth: DisplayDepth,
    /// Best (highest) price first
    pub bids: Vec<DepthLevel>,
    /// Best (lowest) price first
    pub asks: Vec<DepthLevel>,
    /// Larger of the two sides' final cumulative totals
    pub max_cumulative: Decimal,
}

impl OrderBookView {
    /// Depth bar width for a row, as a percentage of `max_cumulative`
    pub fn bar_width_pct(&self, cumulative: Decimal) -> f64 {
        if self.max_cumulative.is_zero() {
            return 0.0;
        }
        let ratio = cumulative / self.max_cumulative * Decimal::ONE_HUNDRED;
        ratio.to_f64().unwrap_or(0.0).clamp(0.0, 100.0)
    }

    pub fn best_bid(&self) -> Option<&DepthLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&DepthLevel> {
        self.asks.first()
    }

    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    pub fn levels(&self, side: BookSide) -> &[DepthLevel] {
        match side {
            BookSide::Bid => &self.bids,
            BookSide::Ask => &self.asks,
        }
    }
}

fn sorted_levels(snapshot: &OrderBookSnapshot, side: BookSide) -> Vec<(Decimal, Decimal)> {
    let mut levels: Vec<(Decimal, Decimal)> = snapshot
        .side(side)
        .iter()
        .filter_map(|(price, quantity)| {
            Some((Decimal::from_str(price).ok()?, Decimal::from_str(quantity).ok()?))
        })
        .collect();

    match side {
        BookSide::Bid => levels.sort_by(|a, b| b.0.cmp(&a.0)),
        BookSide::Ask => levels.sort_by(|a, b| a.0.cmp(&b.0)),
    }
    levels
}

fn with_cumulative(levels: Vec<(Decimal, Decimal)>, depth: usize) -> Vec<DepthLevel> {
    let mut running = Decimal::ZERO;
    levels
        .into_iter()
        .take(depth)
        .map(|(price, quantity)| {
            running += quantity;
            DepthLevel {
                price,
                quantity,
                cumulative: running,
            }
        })
        .collect()
}

/// Project `snapshot` to at most `depth` levels per side
pub fn project(snapshot: &OrderBookSnapshot, depth: DisplayDepth) -> OrderBookView {
    let bids = with_cumulative(sorted_levels(snapshot, BookSide::Bid), depth.levels());
    let asks = with_cumulative(sorted_levels(snapshot, BookSide::Ask), depth.levels());

    let bid_total = bids.last().map(|l| l.cumulative).unwrap_or(Decimal::ZERO);
    let ask_total = asks.last().map(|l| l.cumulative).unwrap_or(Decimal::ZERO);

    OrderBookView {
        symbol: snapshot.symbol.clone(),
        last_update_id: snapshot.last_update_id,
        timestamp: snapshot.timestamp,
        depth,
        bids,
        asks,
        max_cumulative: bid_total.max(ask_total),
    }
}

// ============================================================================
// Formatting
// ============================================================================

fn fixed(value: Decimal, dp: u32) -> String {
    let rounded = value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero);
    format!("{:.*}", dp as usize, rounded)
}

/// Precision by magnitude: >= 1000 two decimals, >= 1 four, else eight
pub fn format_price(price: Decimal) -> String {
    if price >= Decimal::ONE_THOUSAND {
        fixed(price, 2)
    } else if price >= Decimal::ONE {
        fixed(price, 4)
    } else {
        fixed(price, 8)
    }
}

pub fn format_quantity(quantity: Decimal) -> String {
    fixed(quantity, 4)
}

impl fmt::Display for OrderBookView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} last_update_id={} depth={}",
            self.symbol, self.last_update_id, self.depth
        )?;
        writeln!(
            f,
            "{:>16} {:>12} {:>12} | {:<16} {:>12} {:>12}",
            "BID", "QTY", "TOTAL", "ASK", "QTY", "TOTAL"
        )?;

        let rows = self.bids.len().max(self.asks.len());
        for i in 0..rows {
            match self.bids.get(i) {
                Some(l) => write!(
                    f,
                    "{:>16} {:>12} {:>12}",
                    format_price(l.price),
                    format_quantity(l.quantity),
                    format_quantity(l.cumulative)
                )?,
                None => write!(f, "{:>16} {:>12} {:>12}", "", "", "")?,
            }
            write!(f, " | ")?;
            match self.asks.get(i) {
                Some(l) => writeln!(
                    f,
                    "{:<16} {:>12} {:>12}",
                    format_price(l.price),
                    format_quantity(l.quantity),
                    format_quantity(l.cumulative)
                )?,
                None => writeln!(f)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer2::parser::PriceLevel;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn book(bids: &[(&str, &str)], asks: &[(&str, &str)]) -> OrderBookSnapshot {
        let bids: Vec<PriceLevel> = bids.iter().map(|(p, q)| PriceLevel::new(p, q)).collect();
        let asks: Vec<PriceLevel> = asks.iter().map(|(p, q)| PriceLevel::new(p, q)).collect();
        OrderBookSnapshot::from_levels("BTCUSDT", 7, &bids, &asks, 99)
    }

    #[test]
    fn test_display_depth_choices() {
        assert_eq!(DisplayDepth::default().levels(), 15);
        for n in [5, 10, 15, 20, 25] {
            assert_eq!(DisplayDepth::new(n).unwrap().levels(), n);
        }
        assert_eq!(DisplayDepth::new(7), Err(ViewError::UnsupportedDepth(7)));
        assert!(DisplayDepth::try_from(0).is_err());
    }

    #[test]
    fn test_project_sorts_and_accumulates() {
        let snapshot = book(
            &[("99.5", "1"), ("101.25", "2"), ("100", "0.5")],
            &[("102", "3"), ("101.5", "1.5")],
        );
        let view = project(&snapshot, DisplayDepth::new(5).unwrap());

        let bid_prices: Vec<Decimal> = view.bids.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, vec![dec("101.25"), dec("100"), dec("99.5")]);
        assert_eq!(view.bids[1].cumulative, dec("2.5"));
        assert_eq!(view.bids[2].cumulative, dec("3.5"));

        assert_eq!(view.asks[0].price, dec("101.5"));
        assert_eq!(view.asks[1].cumulative, dec("4.5"));

        assert_eq!(view.max_cumulative, dec("4.5"));
        assert_eq!(view.spread(), Some(dec("0.25")));
        assert_eq!(view.last_update_id, 7);
    }

    #[test]
    fn test_project_truncates_fifty_levels_to_fifteen() {
        let owned: Vec<(String, String)> = (0..50)
            .map(|i| (format!("{}.5", 1000 + i * 3), format!("0.{:03}", i + 1)))
            .collect();
        let levels: Vec<(&str, &str)> = owned.iter().map(|(p, q)| (p.as_str(), q.as_str())).collect();
        let snapshot = book(&levels, &[]);

        let view = project(&snapshot, DisplayDepth::default());
        assert_eq!(view.bids.len(), 15);
        assert!(view.bids.windows(2).all(|w| w[0].price > w[1].price));

        let sum: Decimal = view.bids.iter().map(|l| l.quantity).sum();
        assert_eq!(view.bids.last().unwrap().cumulative, sum);
        assert_eq!(view.bids[0].price, dec("1147.5"));
        assert!(view.asks.is_empty());
    }

    #[test]
    fn test_project_does_not_mutate_input() {
        let snapshot = book(&[("1", "1")], &[("2", "1")]);
        let before = snapshot.clone();
        let _ = project(&snapshot, DisplayDepth::default());
        assert_eq!(snapshot, before);
    }

    #[test]
    fn test_unparseable_entries_are_skipped() {
        let mut snapshot = book(&[("10", "1")], &[]);
        snapshot.bids.insert("garbage".to_string(), "1".to_string());
        let view = project(&snapshot, DisplayDepth::default());
        assert_eq!(view.bids.len(), 1);
    }

    #[test]
    fn test_bar_width() {
        let snapshot = book(&[("10", "1"), ("9", "3")], &[("11", "2")]);
        let view = project(&snapshot, DisplayDepth::default());
        assert_eq!(view.max_cumulative, dec("4"));
        assert!((view.bar_width_pct(dec("1")) - 25.0).abs() < 1e-9);
        assert!((view.bar_width_pct(dec("4")) - 100.0).abs() < 1e-9);

        let empty = project(&book(&[], &[]), DisplayDepth::default());
        assert_eq!(empty.bar_width_pct(dec("1")), 0.0);
    }

    #[test]
    fn test_format_price_by_magnitude() {
        assert_eq!(format_price(dec("65000.123")), "65000.12");
        assert_eq!(format_price(dec("1000")), "1000.00");
        assert_eq!(format_price(dec("999.99995")), "1000.0000");
        assert_eq!(format_price(dec("1")), "1.0000");
        assert_eq!(format_price(dec("0.00001234")), "0.00001234");
        assert_eq!(format_price(dec("0.5")), "0.50000000");
    }

    #[test]
    fn test_format_quantity() {
        assert_eq!(format_quantity(dec("1.5")), "1.5000");
        assert_eq!(format_quantity(dec("0.00005")), "0.0001");
    }

    #[test]
    fn test_view_display_renders_rows() {
        let snapshot = book(&[("65000.1", "1")], &[("65000.2", "2"), ("65000.3", "1")]);
        let rendered = project(&snapshot, DisplayDepth::new(5).unwrap()).to_string();
        assert!(rendered.contains("BTCUSDT last_update_id=7 depth=5"));
        assert!(rendered.contains("65000.10"));
        assert!(rendered.contains("65000.30"));
        assert_eq!(rendered.lines().count(), 4);
    }
}
