// Order Book Synchronizer - per-symbol snapshot/diff reconciliation
// Explicit state machine: buffer while fetching, drain on snapshot, refetch on gap

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::types::SequenceRule;
use crate::layer2::orderbook::{ApplyResult, OrderBookSnapshot};
use crate::layer2::parser::DepthUpdateEvent;

/// Per-symbol synchronization state
#[derive(Debug, Clone)]
pub enum SyncState {
    Uninitialized,
    /// Updates are queued, never applied, until the snapshot arrives
    FetchingSnapshot {
        pending: VecDeque<DepthUpdateEvent>,
        in_flight: bool,
        last_error: Option<String>,
    },
    Synced {
        book: Arc<OrderBookSnapshot>,
        /// At least one diff applied on top of the REST snapshot
        bridged: bool,
    },
}

impl SyncState {
    fn fetching() -> Self {
        SyncState::FetchingSnapshot {
            pending: VecDeque::new(),
            in_flight: true,
            last_error: None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SyncState::Uninitialized => "Uninitialized",
            SyncState::FetchingSnapshot { .. } => "FetchingSnapshot",
            SyncState::Synced { .. } => "Synced",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// What consumers of a symbol observe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookFeed {
    pub snapshot: Option<Arc<OrderBookSnapshot>>,
    pub loading: bool,
    pub error: Option<String>,
}

impl Default for BookFeed {
    fn default() -> Self {
        Self {
            snapshot: None,
            loading: true,
            error: None,
        }
    }
}

/// Result of feeding one diff event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// No fetch has been requested for this symbol yet
    Ignored,
    Queued,
    Stale,
    Applied,
    /// Book and queue discarded; a new fetch is now in flight
    GapDetected { expected: u64, got: u64 },
}

/// Result of delivering a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// No fetch was in flight
    Ignored,
    Synced { drained: usize, stale: usize },
    GapDetected { expected: u64, got: u64 },
}

/// Single-owner synchronizer for one symbol
pub struct SymbolSynchronizer {
    pub symbol: String,
    state: SyncState,
    rule: SequenceRule,
    max_pending: usize,
    stats: SynchronizerStats,
}

impl SymbolSynchronizer {
    pub fn new(symbol: &str, rule: SequenceRule, max_pending: usize) -> Self {
        debug!(symbol = symbol, rule = %rule, "SymbolSynchronizer created");

        Self {
            symbol: symbol.to_uppercase(),
            state: SyncState::Uninitialized,
            rule,
            max_pending: max_pending.max(1),
            stats: SynchronizerStats {
                symbol: symbol.to_uppercase(),
                ..SynchronizerStats::default()
            },
        }
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn is_synced(&self) -> bool {
        matches!(self.state, SyncState::Synced { .. })
    }

    pub fn fetch_in_flight(&self) -> bool {
        matches!(self.state, SyncState::FetchingSnapshot { in_flight: true, .. })
    }

    pub fn has_failed(&self) -> bool {
        matches!(
            self.state,
            SyncState::FetchingSnapshot {
                in_flight: false,
                last_error: Some(_),
                ..
            }
        )
    }

    pub fn pending_len(&self) -> usize {
        match &self.state {
            SyncState::FetchingSnapshot { pending, .. } => pending.len(),
            _ => 0,
        }
    }

    /// Mark a fetch as in flight. Returns true when the caller must issue it.
    ///
    /// Never starts a second concurrent fetch and never refetches a synced book.
    pub fn request_snapshot(&mut self) -> bool {
        match &mut self.state {
            SyncState::Uninitialized => {
                self.state = SyncState::fetching();
                true
            }
            SyncState::FetchingSnapshot {
                in_flight,
                last_error,
                ..
            } => {
                if *in_flight {
                    return false;
                }
                *in_flight = true;
                *last_error = None;
                true
            }
            SyncState::Synced { .. } => false,
        }
    }

    /// Feed one diff event in arrival order
    pub fn on_depth_update(&mut self, update: DepthUpdateEvent) -> UpdateOutcome {
        self.stats.updates_received += 1;

        match &mut self.state {
            SyncState::Uninitialized => UpdateOutcome::Ignored,

            SyncState::FetchingSnapshot { pending, .. } => {
                if pending.len() >= self.max_pending {
                    pending.pop_front();
                    self.stats.updates_overflowed += 1;
                }
                pending.push_back(update);
                self.stats.updates_queued += 1;
                UpdateOutcome::Queued
            }

            SyncState::Synced { book, bridged } => {
                // Copy-on-write: consumers holding the previous Arc keep their view
                match Arc::make_mut(book).apply(&update, self.rule, *bridged) {
                    ApplyResult::Applied => {
                        *bridged = true;
                        self.stats.updates_applied += 1;
                        UpdateOutcome::Applied
                    }
                    ApplyResult::Stale => {
                        self.stats.updates_stale += 1;
                        UpdateOutcome::Stale
                    }
                    ApplyResult::Gap { expected, got } => {
                        self.enter_gap(expected, got);
                        UpdateOutcome::GapDetected { expected, got }
                    }
                }
            }
        }
    }

    /// Deliver a fetched snapshot and drain the queue through the apply rules
    pub fn on_snapshot(&mut self, snapshot: OrderBookSnapshot) -> SnapshotOutcome {
        let pending = match &mut self.state {
            SyncState::FetchingSnapshot {
                pending,
                in_flight: true,
                ..
            } => std::mem::take(pending),
            _ => {
                debug!(symbol = %self.symbol, "Snapshot arrived with no fetch in flight, ignoring");
                return SnapshotOutcome::Ignored;
            }
        };

        let snapshot_id = snapshot.last_update_id;
        let mut book = snapshot;
        let mut bridged = false;
        let mut drained = 0;
        let mut stale = 0;

        for update in &pending {
            match book.apply(update, self.rule, bridged) {
                ApplyResult::Applied => {
                    bridged = true;
                    drained += 1;
                    self.stats.updates_applied += 1;
                }
                ApplyResult::Stale => {
                    stale += 1;
                    self.stats.updates_stale += 1;
                }
                ApplyResult::Gap { expected, got } => {
                    self.enter_gap(expected, got);
                    return SnapshotOutcome::GapDetected { expected, got };
                }
            }
        }

        self.stats.snapshots_applied += 1;
        info!(
            symbol = %self.symbol,
            snapshot_id = snapshot_id,
            last_update_id = book.last_update_id,
            drained = drained,
            stale = stale,
            "Order book synchronized"
        );

        self.state = SyncState::Synced {
            book: Arc::new(book),
            bridged,
        };
        SnapshotOutcome::Synced { drained, stale }
    }

    /// Record a failed fetch. The queue is kept so a retry can still bridge it.
    pub fn on_snapshot_error(&mut self, message: String) -> bool {
        match &mut self.state {
            SyncState::FetchingSnapshot {
                in_flight,
                last_error,
                ..
            } if *in_flight => {
                warn!(symbol = %self.symbol, error = %message, "Snapshot fetch failed");
                *in_flight = false;
                *last_error = Some(message);
                self.stats.snapshot_failures += 1;
                true
            }
            _ => false,
        }
    }

    fn enter_gap(&mut self, expected: u64, got: u64) {
        warn!(
            symbol = %self.symbol,
            expected = expected,
            got = got,
            "Sequence gap detected, discarding book and refetching"
        );
        self.stats.gap_count += 1;
        self.state = SyncState::fetching();
    }

    /// Current value for consumers
    pub fn feed(&self) -> BookFeed {
        match &self.state {
            SyncState::Uninitialized => BookFeed::default(),
            SyncState::FetchingSnapshot {
                in_flight,
                last_error,
                ..
            } => BookFeed {
                snapshot: None,
                loading: *in_flight,
                error: last_error.clone(),
            },
            SyncState::Synced { book, .. } => BookFeed {
                snapshot: Some(Arc::clone(book)),
                loading: false,
                error: None,
            },
        }
    }

    /// Get synchronizer statistics
    pub fn get_stats(&self) -> SynchronizerStats {
        let mut stats = self.stats.clone();
        stats.state = self.state.name().to_string();
        stats.pending = self.pending_len();
        stats.last_update_id = match &self.state {
            SyncState::Synced { book, .. } => Some(book.last_update_id),
            _ => None,
        };
        stats
    }
}

/// Synchronizer statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynchronizerStats {
    pub symbol: String,
    pub state: String,
    pub last_update_id: Option<u64>,
    pub pending: usize,
    pub updates_received: u64,
    pub updates_applied: u64,
    pub updates_queued: u64,
    pub updates_stale: u64,
    pub updates_overflowed: u64,
    pub gap_count: u64,
    pub snapshots_applied: u64,
    pub snapshot_failures: u64,
}

impl SynchronizerStats {
    pub fn gap_rate(&self) -> f64 {
        if self.updates_applied > 0 {
            self.gap_count as f64 / self.updates_applied as f64
        } else {
            0.0
        }
    }
}

impl fmt::Display for SynchronizerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SynchronizerStats({} {}, received={}, applied={}, queued={}, stale={}, overflowed={}, gaps={}, snapshots={}, failures={})",
            self.symbol,
            self.state,
            self.updates_received,
            self.updates_applied,
            self.updates_queued,
            self.updates_stale,
            self.updates_overflowed,
            self.gap_count,
            self.snapshots_applied,
            self.snapshot_failures
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer2::parser::PriceLevel;

    fn update(first: u64, last: u64) -> DepthUpdateEvent {
        DepthUpdateEvent {
            symbol: "BTCUSDT".to_string(),
            first_update_id: first,
            final_update_id: last,
            prev_final_update_id: None,
            event_time: 123456 + last,
            bids: vec![PriceLevel::new(&format!("{}.0", 50000 + last), "1.0")],
            asks: vec![],
        }
    }

    fn snapshot(last_update_id: u64) -> OrderBookSnapshot {
        OrderBookSnapshot::from_levels(
            "BTCUSDT",
            last_update_id,
            &[PriceLevel::new("50000.0", "1.0")],
            &[PriceLevel::new("50001.0", "1.0")],
            1,
        )
    }

    fn synchronizer() -> SymbolSynchronizer {
        SymbolSynchronizer::new("btcusdt", SequenceRule::FirstUpdateId, 100)
    }

    #[test]
    fn test_synchronizer_creation() {
        let sync = synchronizer();
        assert_eq!(sync.symbol, "BTCUSDT");
        assert!(!sync.is_synced());
        assert_eq!(sync.feed(), BookFeed::default());
        assert!(sync.feed().loading);
    }

    #[test]
    fn test_updates_ignored_before_fetch() {
        let mut sync = synchronizer();
        assert_eq!(sync.on_depth_update(update(1, 2)), UpdateOutcome::Ignored);
        assert_eq!(sync.pending_len(), 0);
    }

    #[test]
    fn test_single_fetch_in_flight() {
        let mut sync = synchronizer();
        assert!(sync.request_snapshot());
        assert!(!sync.request_snapshot());
        assert!(sync.fetch_in_flight());
    }

    #[test]
    fn test_buffer_then_drain() {
        let mut sync = synchronizer();
        sync.request_snapshot();

        assert_eq!(sync.on_depth_update(update(95, 99)), UpdateOutcome::Queued);
        assert_eq!(sync.on_depth_update(update(100, 105)), UpdateOutcome::Queued);
        assert_eq!(sync.on_depth_update(update(106, 110)), UpdateOutcome::Queued);
        assert_eq!(sync.pending_len(), 3);

        let outcome = sync.on_snapshot(snapshot(100));
        assert_eq!(outcome, SnapshotOutcome::Synced { drained: 2, stale: 1 });
        assert!(sync.is_synced());

        let feed = sync.feed();
        let book = feed.snapshot.unwrap();
        assert_eq!(book.last_update_id, 110);
        assert!(!feed.loading);
        assert!(feed.error.is_none());
        assert_eq!(sync.get_stats().updates_stale, 1);
    }

    #[test]
    fn test_queued_updates_all_stale() {
        let mut sync = synchronizer();
        sync.request_snapshot();
        sync.on_depth_update(update(90, 95));
        sync.on_depth_update(update(96, 100));

        assert_eq!(sync.on_snapshot(snapshot(100)), SnapshotOutcome::Synced { drained: 0, stale: 2 });
        assert_eq!(sync.feed().snapshot.unwrap().last_update_id, 100);
    }

    #[test]
    fn test_gap_during_drain_refetches() {
        let mut sync = synchronizer();
        sync.request_snapshot();
        sync.on_depth_update(update(150, 160));

        assert_eq!(
            sync.on_snapshot(snapshot(100)),
            SnapshotOutcome::GapDetected { expected: 101, got: 150 }
        );
        assert!(sync.fetch_in_flight());
        assert_eq!(sync.pending_len(), 0);
        assert!(sync.feed().snapshot.is_none());
        assert_eq!(sync.get_stats().gap_count, 1);
    }

    #[test]
    fn test_gap_while_synced() {
        let mut sync = synchronizer();
        sync.request_snapshot();
        sync.on_snapshot(snapshot(100));

        assert_eq!(sync.on_depth_update(update(101, 101)), UpdateOutcome::Applied);
        assert_eq!(
            sync.on_depth_update(update(103, 104)),
            UpdateOutcome::GapDetected { expected: 102, got: 103 }
        );
        assert!(sync.fetch_in_flight());
        // The gap-revealing update is not kept
        assert_eq!(sync.pending_len(), 0);
        // Exactly one fetch: another request does nothing
        assert!(!sync.request_snapshot());
    }

    #[test]
    fn test_stale_update_while_synced() {
        let mut sync = synchronizer();
        sync.request_snapshot();
        sync.on_snapshot(snapshot(100));
        let before = sync.feed();

        assert_eq!(sync.on_depth_update(update(99, 100)), UpdateOutcome::Stale);
        assert_eq!(sync.feed(), before);
    }

    #[test]
    fn test_published_snapshot_is_immutable() {
        let mut sync = synchronizer();
        sync.request_snapshot();
        sync.on_snapshot(snapshot(100));

        let held = sync.feed().snapshot.unwrap();
        sync.on_depth_update(update(101, 102));

        assert_eq!(held.last_update_id, 100);
        assert_eq!(sync.feed().snapshot.unwrap().last_update_id, 102);
    }

    #[test]
    fn test_snapshot_error_keeps_queue_and_allows_retry() {
        let mut sync = synchronizer();
        sync.request_snapshot();
        sync.on_depth_update(update(101, 102));

        assert!(sync.on_snapshot_error("timeout".to_string()));
        assert!(sync.has_failed());
        assert_eq!(sync.pending_len(), 1);

        let feed = sync.feed();
        assert!(!feed.loading);
        assert_eq!(feed.error.as_deref(), Some("timeout"));

        // Snapshot with nothing in flight is ignored
        assert_eq!(sync.on_snapshot(snapshot(100)), SnapshotOutcome::Ignored);

        assert!(sync.request_snapshot());
        assert!(sync.feed().error.is_none());
        assert_eq!(sync.on_snapshot(snapshot(100)), SnapshotOutcome::Synced { drained: 1, stale: 0 });
        assert_eq!(sync.get_stats().snapshot_failures, 1);
    }

    #[test]
    fn test_synced_symbol_is_not_refetched() {
        let mut sync = synchronizer();
        sync.request_snapshot();
        sync.on_snapshot(snapshot(100));
        assert!(!sync.request_snapshot());
        assert!(!sync.on_snapshot_error("late".to_string()));
    }

    #[test]
    fn test_pending_queue_overflow_drops_oldest() {
        let mut sync = SymbolSynchronizer::new("BTCUSDT", SequenceRule::FirstUpdateId, 2);
        sync.request_snapshot();
        sync.on_depth_update(update(101, 101));
        sync.on_depth_update(update(102, 102));
        sync.on_depth_update(update(103, 103));

        assert_eq!(sync.pending_len(), 2);
        assert_eq!(sync.get_stats().updates_overflowed, 1);

        // The dropped update was needed, so the drain finds a gap
        assert_eq!(
            sync.on_snapshot(snapshot(100)),
            SnapshotOutcome::GapDetected { expected: 101, got: 102 }
        );
    }

    #[test]
    fn test_previous_final_id_rule_in_synchronizer() {
        let mut sync = SymbolSynchronizer::new("BTCUSDT", SequenceRule::PreviousFinalId, 100);
        sync.request_snapshot();

        let mut first = update(90, 120);
        first.prev_final_update_id = Some(89);
        let mut second = update(130, 140);
        second.prev_final_update_id = Some(120);
        sync.on_depth_update(first);
        sync.on_depth_update(second);

        assert_eq!(sync.on_snapshot(snapshot(100)), SnapshotOutcome::Synced { drained: 2, stale: 0 });

        let mut broken = update(150, 160);
        broken.prev_final_update_id = Some(145);
        assert_eq!(
            sync.on_depth_update(broken),
            UpdateOutcome::GapDetected { expected: 140, got: 145 }
        );
    }

    #[test]
    fn test_stats_display() {
        let mut sync = synchronizer();
        sync.request_snapshot();
        sync.on_depth_update(update(101, 101));
        let stats = sync.get_stats();
        assert_eq!(stats.state, "FetchingSnapshot");
        assert_eq!(stats.pending, 1);
        assert!(stats.to_string().contains("queued=1"));
    }
}
