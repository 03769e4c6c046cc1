// Configuration Management for Depth Sync
// JSON file sections + environment overrides, validated before use

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::core::types::SequenceRule;

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Depth choices offered by the order book display
pub const DISPLAY_DEPTH_CHOICES: [usize; 5] = [5, 10, 15, 20, 25];

/// Upper bound for snapshot request retries
pub const MAX_REQUEST_RETRIES: u32 = 10;

// ============================================================================
// Configuration Structures
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BinanceConfig {
    pub rest_base_url: String,
    pub ws_url: String,

    // Snapshot settings
    pub snapshot_limit: u32,
    pub request_timeout_ms: u64,
    pub request_max_retries: u32,

    // WebSocket settings
    pub ws_ping_interval_secs: u64,
    pub ws_health_check_interval_secs: u64,
    pub ws_stale_timeout_secs: u64,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            rest_base_url: "https://fapi.binance.com".to_string(),
            ws_url: "wss://fstream.binance.com/ws".to_string(),
            snapshot_limit: 500,
            request_timeout_ms: 10_000,
            request_max_retries: 0,
            ws_ping_interval_secs: 20,
            ws_health_check_interval_secs: 30,
            ws_stale_timeout_secs: 600,
        }
    }
}

impl BinanceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_pending_updates: usize,
    pub sequence_rule: SequenceRule,
    pub idle_ttl_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_pending_updates: 10_000,
            sequence_rule: SequenceRule::FirstUpdateId,
            idle_ttl_ms: 30_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl SyncConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub depth_levels: usize,
    pub refresh_interval_ms: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            depth_levels: 15,
            refresh_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub json_logs: bool,
    pub metrics_interval_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            json_logs: false,
            metrics_interval_secs: 60,
        }
    }
}

// ============================================================================
// Configuration Summary
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub rest_base_url: String,
    pub ws_url: String,
    pub snapshot_limit: u32,
    pub sequence_rule: SequenceRule,
    pub idle_ttl_ms: u64,
    pub depth_levels: usize,
    pub log_level: String,
}

// ============================================================================
// Configuration Manager
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ConfigManager {
    binance: BinanceConfig,
    reconnect: ReconnectConfig,
    sync: SyncConfig,
    display: DisplayConfig,
    monitoring: MonitoringConfig,
}

impl ConfigManager {
    pub fn new(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut manager = Self::default();

        if let Some(path) = config_path {
            manager.load_from_file(path)?;
        }

        manager.load_from_env();

        info!("Configuration initialized");
        Ok(manager)
    }

    /// Load configuration from JSON file. Missing sections keep their defaults.
    pub fn load_from_file(&mut self, config_path: &str) -> Result<(), ConfigError> {
        let path = Path::new(config_path);
        if !path.exists() {
            warn!(path = config_path, "Config file not found");
            return Ok(());
        }

        let content = fs::read_to_string(path)?;
        self.load_from_str(&content)?;

        info!(path = config_path, "Configuration loaded");
        Ok(())
    }

    /// Load configuration from a JSON document
    pub fn load_from_str(&mut self, content: &str) -> Result<(), ConfigError> {
        let config_data: HashMap<String, serde_json::Value> = serde_json::from_str(content)?;

        if let Some(data) = config_data.get("binance") {
            self.binance = serde_json::from_value(data.clone())?;
        }
        if let Some(data) = config_data.get("reconnect") {
            self.reconnect = serde_json::from_value(data.clone())?;
        }
        if let Some(data) = config_data.get("sync") {
            self.sync = serde_json::from_value(data.clone())?;
        }
        if let Some(data) = config_data.get("display") {
            self.display = serde_json::from_value(data.clone())?;
        }
        if let Some(data) = config_data.get("monitoring") {
            self.monitoring = serde_json::from_value(data.clone())?;
        }

        Ok(())
    }

    /// Apply environment overrides
    pub fn load_from_env(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("BINANCE_FUTURES_API_URL") {
            self.binance.rest_base_url = url;
        }
        if let Some(url) = lookup("BINANCE_FUTURES_WS_URL") {
            self.binance.ws_url = url;
        }
        if let Some(level) = lookup("DEPTH_SYNC_LOG_LEVEL") {
            self.monitoring.log_level = level;
        }
    }

    /// Save configuration to JSON file
    pub fn save_to_file(&self, config_path: &str) -> Result<(), ConfigError> {
        let mut config_map = HashMap::new();
        config_map.insert("binance", serde_json::to_value(&self.binance)?);
        config_map.insert("reconnect", serde_json::to_value(&self.reconnect)?);
        config_map.insert("sync", serde_json::to_value(&self.sync)?);
        config_map.insert("display", serde_json::to_value(&self.display)?);
        config_map.insert("monitoring", serde_json::to_value(&self.monitoring)?);

        if let Some(parent) = Path::new(config_path).parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&config_map)?;
        fs::write(config_path, json)?;

        info!(path = config_path, "Configuration saved");
        Ok(())
    }

    /// Validate configuration, logging every problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if !self.binance.rest_base_url.starts_with("http") {
            errors.push("binance.rest_base_url must be an http(s) URL".to_string());
        }
        if !self.binance.ws_url.starts_with("ws") {
            errors.push("binance.ws_url must be a ws(s) URL".to_string());
        }
        if self.binance.snapshot_limit == 0 || self.binance.snapshot_limit > 1000 {
            errors.push("binance.snapshot_limit must be between 1 and 1000".to_string());
        }
        if self.binance.request_max_retries > MAX_REQUEST_RETRIES {
            errors.push(format!(
                "binance.request_max_retries must not exceed {}",
                MAX_REQUEST_RETRIES
            ));
        }
        if self.binance.request_timeout_ms == 0 {
            errors.push("binance.request_timeout_ms must be positive".to_string());
        }
        if self.reconnect.backoff_factor < 1.0 {
            errors.push("reconnect.backoff_factor must be >= 1.0".to_string());
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            errors.push("reconnect.initial_delay_ms must not exceed max_delay_ms".to_string());
        }
        if self.sync.max_pending_updates == 0 {
            errors.push("sync.max_pending_updates must be positive".to_string());
        }
        if self.sync.sweep_interval_ms == 0 {
            errors.push("sync.sweep_interval_ms must be positive".to_string());
        }
        if !DISPLAY_DEPTH_CHOICES.contains(&self.display.depth_levels) {
            errors.push(format!(
                "display.depth_levels must be one of {:?}",
                DISPLAY_DEPTH_CHOICES
            ));
        }

        if !errors.is_empty() {
            for error in &errors {
                warn!(error = %error, "Config validation error");
            }
            return Err(ConfigError::Validation(errors.join("; ")));
        }

        info!("Configuration validated successfully");
        Ok(())
    }

    pub fn get_summary(&self) -> ConfigSummary {
        ConfigSummary {
            rest_base_url: self.binance.rest_base_url.clone(),
            ws_url: self.binance.ws_url.clone(),
            snapshot_limit: self.binance.snapshot_limit,
            sequence_rule: self.sync.sequence_rule,
            idle_ttl_ms: self.sync.idle_ttl_ms,
            depth_levels: self.display.depth_levels,
            log_level: self.monitoring.log_level.clone(),
        }
    }

    pub fn binance(&self) -> BinanceConfig {
        self.binance.clone()
    }

    pub fn reconnect(&self) -> ReconnectConfig {
        self.reconnect.clone()
    }

    pub fn sync(&self) -> SyncConfig {
        self.sync.clone()
    }

    pub fn display(&self) -> DisplayConfig {
        self.display.clone()
    }

    pub fn monitoring(&self) -> MonitoringConfig {
        self.monitoring.clone()
    }

    pub fn set_display_depth(&mut self, depth: usize) {
        self.display.depth_levels = depth;
    }
}
