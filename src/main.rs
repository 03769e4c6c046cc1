// depth-watch - terminal consumer of synchronized Binance futures order books
// Subscribes to symbols and logs the projected top-of-book as it changes

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use depth_sync::core::{setup_logging, ConfigManager};
use depth_sync::layer1::{BinanceRestClient, SnapshotSource, StreamControl, WebSocketClient};
use depth_sync::layer2::{
    project, BookSubscription, DisplayDepth, OrderBookService, ServiceConfig, UnifiedMetrics,
};

/// Pause between automatic retries of a failed snapshot fetch
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "depth-watch")]
#[command(about = "Watch locally synchronized Binance futures order books")]
struct Args {
    /// JSON config file
    #[arg(long)]
    config: Option<String>,

    /// Symbol to watch (repeatable)
    #[arg(long = "symbol", default_values_t = vec!["BTCUSDT".to_string()])]
    symbols: Vec<String>,

    /// Levels per side: 5, 10, 15, 20 or 25
    #[arg(long)]
    depth: Option<usize>,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = ConfigManager::new(args.config.as_deref())?;
    if let Some(depth) = args.depth {
        config.set_display_depth(depth);
    }

    let monitoring = config.monitoring();
    setup_logging(Some(&monitoring.log_level), args.json_logs || monitoring.json_logs);
    config.validate()?;

    let summary = config.get_summary();
    info!(
        rest = %summary.rest_base_url,
        ws = %summary.ws_url,
        rule = %summary.sequence_rule,
        depth = summary.depth_levels,
        symbols = ?args.symbols,
        "depth-watch starting"
    );

    let display = config.display();
    let depth = DisplayDepth::new(display.depth_levels)?;
    let refresh = Duration::from_millis(display.refresh_interval_ms.max(100));

    let (ws, events) = WebSocketClient::new(&config.binance(), &config.reconnect());
    let ws = Arc::new(ws);
    let rest = Arc::new(BinanceRestClient::from_config(&config.binance())?);
    ws.connect();

    let service = OrderBookService::spawn(
        ServiceConfig::from_manager(&config),
        Arc::clone(&ws) as Arc<dyn StreamControl>,
        Arc::clone(&rest) as Arc<dyn SnapshotSource>,
        events,
    );

    let mut watchers = Vec::new();
    for symbol in &args.symbols {
        let subscription = service.subscribe(symbol).await?;
        watchers.push(tokio::spawn(watch_book(subscription, depth, refresh)));
    }

    let started = Instant::now();
    let mut metrics_tick =
        tokio::time::interval(Duration::from_secs(monitoring.metrics_interval_secs.max(1)));
    metrics_tick.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            _ = metrics_tick.tick() => {
                let books = service.stats().await.unwrap_or_default();
                let metrics = UnifiedMetrics::from_stats(Some(ws.get_stats()), Some(rest.get_stats()), books);
                metrics.print_compact(started.elapsed().as_secs());
            }
        }
    }

    for watcher in &watchers {
        watcher.abort();
    }
    let books = service.stats().await.unwrap_or_default();
    UnifiedMetrics::from_stats(Some(ws.get_stats()), Some(rest.get_stats()), books).print_report();

    service.shutdown().await;
    ws.disconnect();
    Ok(())
}

/// Log the projected book at most once per `refresh`, and only when it moved
async fn watch_book(subscription: BookSubscription, depth: DisplayDepth, refresh: Duration) {
    let symbol = subscription.symbol().to_uppercase();
    let mut tick = tokio::time::interval(refresh);
    let mut last_shown: Option<u64> = None;
    let mut last_error: Option<String> = None;
    let mut last_retry: Option<Instant> = None;

    loop {
        tick.tick().await;
        let feed = subscription.current();

        if let Some(message) = &feed.error {
            if last_error.as_ref() != Some(message) {
                error!(symbol = %symbol, error = %message, "Order book unavailable");
                last_error = Some(message.clone());
            }
            if last_retry.map(|t| t.elapsed() >= RETRY_INTERVAL).unwrap_or(true) {
                last_retry = Some(Instant::now());
                warn!(symbol = %symbol, "Retrying snapshot fetch");
                if subscription.retry().is_err() {
                    return;
                }
            }
            continue;
        }
        last_error = None;

        match &feed.snapshot {
            Some(snapshot) if last_shown != Some(snapshot.last_update_id) => {
                last_shown = Some(snapshot.last_update_id);
                let view = project(snapshot, depth);
                info!(
                    symbol = %symbol,
                    last_update_id = view.last_update_id,
                    spread = ?view.spread(),
                    "\n{}",
                    view
                );
            }
            Some(_) => {}
            None if feed.loading => {}
            None => warn!(symbol = %symbol, "No order book data"),
        }
    }
}
