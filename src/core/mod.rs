// Core Module - Foundational types, config, logging
// Shared by the connectors (layer1) and the book processing (layer2)

pub mod types;
pub mod config;
pub mod logger;

// Re-export commonly used items for convenience
pub use types::*;
pub use config::{
    BinanceConfig, ReconnectConfig, SyncConfig, DisplayConfig, MonitoringConfig,
    ConfigManager, ConfigSummary, ConfigError, DISPLAY_DEPTH_CHOICES,
};
pub use logger::setup_logging;
