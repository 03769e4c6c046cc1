// Order Book Service - registry of per-symbol synchronizers
// One task owns every book; consumers, transport events and fetch results arrive as messages

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::core::config::{ConfigManager, SyncConfig};
use crate::core::types::{depth_stream_name, rest_symbol, symbol_key, ConnectionStatus};
use crate::layer1::rest_client::{SnapshotError, SnapshotSource};
use crate::layer1::websocket::{StreamControl, TransportEvent, MAX_RECONNECT_ERROR, NORMAL_CLOSE_CODE};
use crate::layer2::orderbook::OrderBookSnapshot;
use crate::layer2::synchronizer::{
    BookFeed, SnapshotOutcome, SymbolSynchronizer, SynchronizerStats, UpdateOutcome,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("Order book service has stopped")]
    Stopped,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub sync: SyncConfig,
    /// Upper bound for one snapshot fetch, retries included
    pub fetch_timeout: Duration,
}

impl ServiceConfig {
    pub fn from_manager(config: &ConfigManager) -> Self {
        Self {
            sync: config.sync(),
            fetch_timeout: config.binance().request_timeout(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_manager(&ConfigManager::default())
    }
}

// ============================================================================
// Messages
// ============================================================================

enum ServiceCommand {
    Subscribe {
        symbol: String,
        reply: oneshot::Sender<(u64, watch::Receiver<BookFeed>)>,
    },
    Unsubscribe {
        symbol: String,
        id: u64,
    },
    Retry {
        symbol: String,
    },
    Stats {
        reply: oneshot::Sender<Vec<SynchronizerStats>>,
    },
    Shutdown,
}

struct FetchResult {
    symbol: String,
    result: Result<OrderBookSnapshot, String>,
}

// ============================================================================
// Consumer handle
// ============================================================================

/// A consumer's view of one symbol. Dropping it releases the reference.
pub struct BookSubscription {
    id: u64,
    symbol: String,
    feed_rx: watch::Receiver<BookFeed>,
    cmd_tx: mpsc::UnboundedSender<ServiceCommand>,
}

impl BookSubscription {
    /// Registry key ("btcusdt")
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn current(&self) -> BookFeed {
        self.feed_rx.borrow().clone()
    }

    /// Re-issue this symbol's snapshot fetch if the last one failed
    pub fn retry(&self) -> Result<(), ServiceError> {
        self.cmd_tx
            .send(ServiceCommand::Retry {
                symbol: self.symbol.clone(),
            })
            .map_err(|_| ServiceError::Stopped)
    }

    /// Wait for the next published value
    pub async fn changed(&mut self) -> Result<BookFeed, ServiceError> {
        self.feed_rx.changed().await.map_err(|_| ServiceError::Stopped)?;
        Ok(self.feed_rx.borrow_and_update().clone())
    }
}

impl Drop for BookSubscription {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(ServiceCommand::Unsubscribe {
            symbol: self.symbol.clone(),
            id: self.id,
        });
    }
}

// ============================================================================
// Service handle
// ============================================================================

pub struct OrderBookService {
    cmd_tx: mpsc::UnboundedSender<ServiceCommand>,
    status_rx: watch::Receiver<ConnectionStatus>,
    task: JoinHandle<()>,
}

impl OrderBookService {
    /// Start the registry task on the current tokio runtime
    pub fn spawn(
        config: ServiceConfig,
        transport: Arc<dyn StreamControl>,
        snapshots: Arc<dyn SnapshotSource>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

        info!(
            rule = %config.sync.sequence_rule,
            idle_ttl_ms = config.sync.idle_ttl_ms,
            max_pending = config.sync.max_pending_updates,
            "Order book service started"
        );

        let registry = Registry {
            config,
            entries: HashMap::new(),
            transport,
            snapshots,
            fetch_tx,
            status_tx,
            next_subscriber_id: 1,
        };
        let task = tokio::spawn(registry.run(cmd_rx, fetch_rx, events));

        Self {
            cmd_tx,
            status_rx,
            task,
        }
    }

    /// Subscribe to a symbol (case-insensitive)
    pub async fn subscribe(&self, symbol: &str) -> Result<BookSubscription, ServiceError> {
        let key = symbol_key(symbol);
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(ServiceCommand::Subscribe {
                symbol: key.clone(),
                reply,
            })
            .map_err(|_| ServiceError::Stopped)?;
        let (id, feed_rx) = response.await.map_err(|_| ServiceError::Stopped)?;

        Ok(BookSubscription {
            id,
            symbol: key,
            feed_rx,
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    /// Release a subscription
    pub fn unsubscribe(&self, handle: BookSubscription) {
        drop(handle);
    }

    /// Re-issue a failed snapshot fetch
    pub fn retry(&self, symbol: &str) -> Result<(), ServiceError> {
        self.cmd_tx
            .send(ServiceCommand::Retry {
                symbol: symbol_key(symbol),
            })
            .map_err(|_| ServiceError::Stopped)
    }

    /// Per-symbol synchronizer statistics, sorted by symbol
    pub async fn stats(&self) -> Result<Vec<SynchronizerStats>, ServiceError> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(ServiceCommand::Stats { reply })
            .map_err(|_| ServiceError::Stopped)?;
        response.await.map_err(|_| ServiceError::Stopped)
    }

    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Stop the registry task and release every stream subscription
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(ServiceCommand::Shutdown);
        if let Err(e) = self.task.await {
            error!(error = %e, "Order book service task failed");
        }
    }
}

// ============================================================================
// Registry task
// ============================================================================

struct SymbolEntry {
    sync: SymbolSynchronizer,
    subscribers: HashSet<u64>,
    feed_tx: watch::Sender<BookFeed>,
    idle_since: Option<Instant>,
}

impl SymbolEntry {
    fn publish(&self) {
        self.feed_tx.send_replace(self.sync.feed());
    }
}

struct Registry {
    config: ServiceConfig,
    entries: HashMap<String, SymbolEntry>,
    transport: Arc<dyn StreamControl>,
    snapshots: Arc<dyn SnapshotSource>,
    fetch_tx: mpsc::UnboundedSender<FetchResult>,
    status_tx: watch::Sender<ConnectionStatus>,
    next_subscriber_id: u64,
}

impl Registry {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<ServiceCommand>,
        mut fetch_rx: mpsc::UnboundedReceiver<FetchResult>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let mut sweep = tokio::time::interval(self.config.sync.sweep_interval().max(Duration::from_millis(1)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(ServiceCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(fetch) = fetch_rx.recv() => self.on_fetch_result(fetch),
                event = events.recv(), if events_open => match event {
                    Some(event) => self.on_transport_event(event),
                    None => {
                        warn!("Transport event channel closed");
                        events_open = false;
                        self.status_tx.send_replace(ConnectionStatus::Disconnected);
                    }
                },
                _ = sweep.tick() => self.evict_idle(Instant::now()),
            }
        }

        let streams: Vec<String> = self.entries.keys().map(|k| depth_stream_name(k)).collect();
        if !streams.is_empty() {
            if let Err(e) = self.transport.unsubscribe(&streams) {
                debug!(error = %e, "Unsubscribe on shutdown failed");
            }
        }
        info!(symbols = self.entries.len(), "Order book service stopped");
    }

    fn handle_command(&mut self, cmd: ServiceCommand) {
        match cmd {
            ServiceCommand::Subscribe { symbol, reply } => {
                let id = self.next_subscriber_id;
                self.next_subscriber_id += 1;
                let feed_rx = self.add_subscriber(&symbol, id);
                if reply.send((id, feed_rx)).is_err() {
                    // Caller gave up before the reply; release right away
                    self.remove_subscriber(&symbol, id);
                }
            }
            ServiceCommand::Unsubscribe { symbol, id } => self.remove_subscriber(&symbol, id),
            ServiceCommand::Retry { symbol } => self.retry(&symbol),
            ServiceCommand::Stats { reply } => {
                let mut stats: Vec<SynchronizerStats> =
                    self.entries.values().map(|e| e.sync.get_stats()).collect();
                stats.sort_by(|a, b| a.symbol.cmp(&b.symbol));
                let _ = reply.send(stats);
            }
            ServiceCommand::Shutdown => {}
        }
    }

    fn add_subscriber(&mut self, symbol: &str, id: u64) -> watch::Receiver<BookFeed> {
        let entry = match self.entries.entry(symbol.to_string()) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                let stream = depth_stream_name(symbol);
                if let Err(e) = self.transport.subscribe(&[stream.clone()]) {
                    error!(symbol = symbol, stream = %stream, error = %e, "Stream subscribe failed");
                }
                let sync = SymbolSynchronizer::new(
                    symbol,
                    self.config.sync.sequence_rule,
                    self.config.sync.max_pending_updates,
                );
                let (feed_tx, _) = watch::channel(sync.feed());
                info!(symbol = symbol, stream = %stream, "Symbol registered");
                vacant.insert(SymbolEntry {
                    sync,
                    subscribers: HashSet::new(),
                    feed_tx,
                    idle_since: None,
                })
            }
        };

        entry.subscribers.insert(id);
        entry.idle_since = None;

        // First subscribe, or a subscribe after a failed fetch
        let fetch = entry.sync.request_snapshot();
        if fetch {
            entry.publish();
        }
        // Subscribed after publishing so the handle starts with nothing unseen
        let feed_rx = entry.feed_tx.subscribe();
        if fetch {
            self.spawn_fetch(symbol);
        }

        debug!(symbol = symbol, subscriber = id, "Subscriber added");
        feed_rx
    }

    fn remove_subscriber(&mut self, symbol: &str, id: u64) {
        if let Some(entry) = self.entries.get_mut(symbol) {
            if entry.subscribers.remove(&id) && entry.subscribers.is_empty() {
                entry.idle_since = Some(Instant::now());
                debug!(symbol = symbol, "Symbol idle");
            }
        }
    }

    fn retry(&mut self, symbol: &str) {
        let Some(entry) = self.entries.get_mut(symbol) else {
            debug!(symbol = symbol, "Retry for unknown symbol");
            return;
        };
        if entry.sync.has_failed() && entry.sync.request_snapshot() {
            info!(symbol = symbol, "Retrying snapshot fetch");
            entry.publish();
            self.spawn_fetch(symbol);
        }
    }

    fn spawn_fetch(&self, symbol: &str) {
        let symbol = symbol.to_string();
        let source = Arc::clone(&self.snapshots);
        let tx = self.fetch_tx.clone();
        let timeout = self.config.fetch_timeout;

        debug!(symbol = %symbol, "Fetching depth snapshot");
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, source.fetch_snapshot(&symbol)).await {
                Ok(Ok(snapshot)) => Ok(snapshot),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(SnapshotError::Timeout {
                    symbol: rest_symbol(&symbol),
                    timeout_ms: timeout.as_millis() as u64,
                }
                .to_string()),
            };
            let _ = tx.send(FetchResult { symbol, result });
        });
    }

    fn on_fetch_result(&mut self, fetch: FetchResult) {
        let Some(entry) = self.entries.get_mut(&fetch.symbol) else {
            debug!(symbol = %fetch.symbol, "Snapshot for unknown symbol dropped");
            return;
        };

        match fetch.result {
            Ok(snapshot) => match entry.sync.on_snapshot(snapshot) {
                SnapshotOutcome::Ignored => {}
                SnapshotOutcome::Synced { .. } => entry.publish(),
                SnapshotOutcome::GapDetected { .. } => {
                    entry.publish();
                    self.spawn_fetch(&fetch.symbol);
                }
            },
            Err(message) => {
                if entry.sync.on_snapshot_error(message) {
                    entry.publish();
                }
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::DepthUpdate(update) => {
                let key = symbol_key(&update.symbol);
                let Some(entry) = self.entries.get_mut(&key) else {
                    debug!(symbol = %update.symbol, "Depth update for unregistered symbol");
                    return;
                };
                match entry.sync.on_depth_update(update) {
                    UpdateOutcome::Applied => entry.publish(),
                    UpdateOutcome::GapDetected { .. } => {
                        entry.publish();
                        self.spawn_fetch(&key);
                    }
                    UpdateOutcome::Ignored | UpdateOutcome::Queued | UpdateOutcome::Stale => {}
                }
            }
            TransportEvent::Opened => {
                info!("Transport connected");
                self.status_tx.send_replace(ConnectionStatus::Connected);
            }
            TransportEvent::Closed { code, reason } => {
                // Books stay as they are; only an observed gap forces a refetch
                let status = if code == NORMAL_CLOSE_CODE {
                    ConnectionStatus::Disconnected
                } else {
                    ConnectionStatus::Reconnecting
                };
                info!(code = code, reason = %reason, status = %status, "Transport closed");
                self.status_tx.send_replace(status);
            }
            TransportEvent::Error(message) => {
                if message == MAX_RECONNECT_ERROR {
                    error!("Transport gave up reconnecting");
                    self.status_tx.send_replace(ConnectionStatus::Failed);
                } else {
                    warn!(error = %message, "Transport error");
                }
            }
            TransportEvent::SubscriptionAck { id } => {
                debug!(id = ?id, "Subscription acknowledged");
            }
        }
    }

    /// Drop entries idle past their TTL. Entries awaiting a snapshot stay.
    fn evict_idle(&mut self, now: Instant) {
        let ttl = self.config.sync.idle_ttl();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.subscribers.is_empty()
                    && !e.sync.fetch_in_flight()
                    && e.idle_since.map(|t| now.duration_since(t) >= ttl).unwrap_or(false)
            })
            .map(|(k, _)| k.clone())
            .collect();

        for symbol in expired {
            self.entries.remove(&symbol);
            let stream = depth_stream_name(&symbol);
            if let Err(e) = self.transport.unsubscribe(&[stream.clone()]) {
                warn!(symbol = %symbol, error = %e, "Stream unsubscribe failed");
            }
            info!(symbol = %symbol, stream = %stream, "Idle symbol evicted");
        }
    }
}
