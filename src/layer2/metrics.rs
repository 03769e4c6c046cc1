// Unified Metrics - Collects and formats stats from the connectors and every synchronizer
// Aggregates existing per-component stats into a single view

use std::fmt;
use tracing::info;

use crate::layer1::rest_client::RestClientStats;
use crate::layer1::websocket::WebSocketStats;
use crate::layer2::synchronizer::SynchronizerStats;

/// Unified metrics snapshot from all pipeline components
#[derive(Debug, Clone)]
pub struct UnifiedMetrics {
    pub ws: Option<WebSocketStats>,
    pub rest: Option<RestClientStats>,
    pub books: Vec<SynchronizerStats>,
}

impl UnifiedMetrics {
    /// Create from component stats
    pub fn from_stats(
        ws: Option<WebSocketStats>,
        rest: Option<RestClientStats>,
        books: Vec<SynchronizerStats>,
    ) -> Self {
        Self { ws, rest, books }
    }

    /// Total messages received by WebSocket
    pub fn total_ws_messages(&self) -> u64 {
        self.ws.as_ref().map(|w| w.message_count).unwrap_or(0)
    }

    pub fn total_updates_applied(&self) -> u64 {
        self.books.iter().map(|b| b.updates_applied).sum()
    }

    pub fn total_gaps(&self) -> u64 {
        self.books.iter().map(|b| b.gap_count).sum()
    }

    /// Number of books currently holding a synced snapshot
    pub fn synced_books(&self) -> usize {
        self.books.iter().filter(|b| b.state == "Synced").count()
    }

    /// Total errors across all components.
    /// The connection error count already includes frame parse failures.
    pub fn total_errors(&self) -> u64 {
        let ws_errs = self.ws.as_ref().map(|w| w.error_count).unwrap_or(0);
        let rest_errs = self.rest.as_ref().map(|r| r.requests_failed).unwrap_or(0);
        ws_errs + rest_errs
    }

    /// Print detailed multi-line report
    pub fn print_report(&self) {
        info!("=== DEPTH SYNC METRICS ===");

        if let Some(ws) = &self.ws {
            info!("  WebSocket:    msgs={} errs={} reconnects={} subs={} state={}",
                ws.message_count, ws.error_count, ws.reconnect_count, ws.active_subscriptions, ws.state);
            info!("  Parser:       parsed={} errs={} depth={} acks={} exchange_errs={}",
                ws.parser.messages_parsed, ws.parser.parse_errors, ws.parser.depth_count,
                ws.parser.ack_count, ws.parser.exchange_errors);
        }

        if let Some(rest) = &self.rest {
            info!("  REST:         sent={} ok={} fail={} retries={} rate={:.1}%",
                rest.requests_sent, rest.requests_succeeded, rest.requests_failed,
                rest.retries, rest.success_rate * 100.0);
        }

        for book in &self.books {
            let last_id = book.last_update_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string());
            info!("  {:<12} state={} last_id={} applied={} queued={} stale={} gaps={} snapshots={} failures={}",
                book.symbol, book.state, last_id, book.updates_applied, book.updates_queued,
                book.updates_stale, book.gap_count, book.snapshots_applied, book.snapshot_failures);
        }
    }

    /// Print compact single-line stats for periodic logging
    pub fn print_compact(&self, elapsed_secs: u64) {
        let status = self.ws.as_ref()
            .map(|w| w.state.to_string())
            .unwrap_or_else(|| "-".to_string());

        info!("[{:>3}s] {} | books={}/{} applied={} gaps={} | msgs={} errs={}",
            elapsed_secs, status,
            self.synced_books(), self.books.len(),
            self.total_updates_applied(), self.total_gaps(),
            self.total_ws_messages(), self.total_errors());
    }
}

impl fmt::Display for UnifiedMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UnifiedMetrics(books={}, applied={}, gaps={}, errors={})",
            self.books.len(),
            self.total_updates_applied(),
            self.total_gaps(),
            self.total_errors()
        )
    }
}
