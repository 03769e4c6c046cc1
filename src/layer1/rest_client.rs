// REST Client for Binance Futures depth snapshots
// Bounded-depth /fapi/v1/depth fetch with timeout and optional retries

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::config::BinanceConfig;
use crate::core::types::rest_symbol;
use crate::layer2::orderbook::OrderBookSnapshot;
use crate::layer2::parser::{parse_depth_snapshot, ParseError};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Failed to fetch snapshot for {symbol}: {source}")]
    Http {
        symbol: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to fetch snapshot for {symbol}: {status} {reason}. Server: {message}")]
    Status {
        symbol: String,
        status: u16,
        reason: String,
        message: String,
    },
    #[error("Snapshot request for {symbol} timed out after {timeout_ms}ms")]
    Timeout { symbol: String, timeout_ms: u64 },
    #[error("{0}")]
    Validation(String),
}

impl SnapshotError {
    /// Network failures and 5xx/429 responses may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            SnapshotError::Http { .. } | SnapshotError::Timeout { .. } => true,
            SnapshotError::Status { status, .. } => *status >= 500 || *status == 429,
            SnapshotError::Validation(_) => false,
        }
    }
}

// ============================================================================
// Snapshot source seam
// ============================================================================

/// Anything that can produce a point-in-time depth snapshot for a symbol
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, symbol: &str) -> Result<OrderBookSnapshot, SnapshotError>;
}

// ============================================================================
// Client Statistics
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct RestClientStats {
    pub requests_sent: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub retries: u64,
    pub success_rate: f64,
}

impl fmt::Display for RestClientStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RestClientStats(sent={}, ok={}, fail={}, retries={}, rate={:.2}%)",
            self.requests_sent, self.requests_succeeded, self.requests_failed,
            self.retries, self.success_rate * 100.0
        )
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: u64,
    succeeded: u64,
    failed: u64,
    retries: u64,
}

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

// ============================================================================
// Binance REST Client
// ============================================================================

/// Public-endpoint REST client for Binance Futures depth snapshots
pub struct BinanceRestClient {
    base_url: String,
    client: Client,
    snapshot_limit: u32,
    timeout: Duration,
    max_retries: u32,
    retry_base_delay: Duration,
    counters: RwLock<Counters>,
}

impl BinanceRestClient {
    pub fn new(
        base_url: &str,
        snapshot_limit: u32,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            snapshot_limit,
            timeout,
            max_retries,
            retry_base_delay: Duration::from_millis(500),
            counters: RwLock::new(Counters::default()),
        })
    }

    /// Create from config
    pub fn from_config(config: &BinanceConfig) -> Result<Self, reqwest::Error> {
        Self::new(
            &config.rest_base_url,
            config.snapshot_limit,
            config.request_timeout(),
            config.request_max_retries,
        )
    }

    pub fn depth_url(&self, symbol: &str) -> String {
        format!(
            "{}/fapi/v1/depth?symbol={}&limit={}",
            self.base_url,
            rest_symbol(symbol),
            self.snapshot_limit
        )
    }

    /// Single attempt, no retries
    async fn fetch_once(&self, symbol: &str) -> Result<OrderBookSnapshot, SnapshotError> {
        let upper = rest_symbol(symbol);
        let url = self.depth_url(symbol);
        self.counters.write().sent += 1;

        let response = self.client.get(&url).send().await.map_err(|e| self.http_error(&upper, e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.http_error(&upper, e))?;

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("msg").and_then(|m| m.as_str()).map(str::to_string))
                .unwrap_or_else(|| "No additional error message".to_string());
            return Err(SnapshotError::Status {
                symbol: upper,
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("").to_string(),
                message,
            });
        }

        parse_depth_snapshot(symbol, &body).map_err(|e| match e {
            ParseError::ValidationFailed(msg) => SnapshotError::Validation(msg),
            other => SnapshotError::Validation(format!("Invalid snapshot data received for {}: {}", upper, other)),
        })
    }

    fn http_error(&self, symbol: &str, e: reqwest::Error) -> SnapshotError {
        if e.is_timeout() {
            SnapshotError::Timeout {
                symbol: symbol.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            SnapshotError::Http {
                symbol: symbol.to_string(),
                source: e,
            }
        }
    }

    /// Backoff before retry `attempt` (0-based), doubling from the base delay
    fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(MAX_RETRY_DELAY)
    }

    pub fn get_stats(&self) -> RestClientStats {
        let c = self.counters.read();
        let finished = c.succeeded + c.failed;
        RestClientStats {
            requests_sent: c.sent,
            requests_succeeded: c.succeeded,
            requests_failed: c.failed,
            retries: c.retries,
            success_rate: if finished > 0 {
                c.succeeded as f64 / finished as f64
            } else {
                0.0
            },
        }
    }
}

#[async_trait]
impl SnapshotSource for BinanceRestClient {
    async fn fetch_snapshot(&self, symbol: &str) -> Result<OrderBookSnapshot, SnapshotError> {
        let mut attempt = 0u32;
        loop {
            match self.fetch_once(symbol).await {
                Ok(snapshot) => {
                    self.counters.write().succeeded += 1;
                    debug!(
                        symbol = %snapshot.symbol,
                        last_update_id = snapshot.last_update_id,
                        bids = snapshot.bid_levels(),
                        asks = snapshot.ask_levels(),
                        "Depth snapshot fetched"
                    );
                    return Ok(snapshot);
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.retry_delay(attempt);
                    attempt += 1;
                    self.counters.write().retries += 1;
                    warn!(
                        symbol = symbol,
                        attempt = attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Snapshot request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.counters.write().failed += 1;
                    return Err(e);
                }
            }
        }
    }
}
