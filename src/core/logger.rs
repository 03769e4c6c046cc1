// Structured Logging for Depth Sync
// tracing-subscriber setup shared by the library tests and the depth-watch binary

use std::sync::Once;
use tracing::Level;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

// Dependencies that log every frame at debug level
const NOISY_TARGETS: [&str; 5] = [
    "tokio_tungstenite=warn",
    "tungstenite=warn",
    "hyper=warn",
    "hyper_util=warn",
    "reqwest=warn",
];

fn parse_level(log_level: &str) -> Level {
    match log_level.to_uppercase().as_str() {
        "TRACE" => Level::TRACE,
        "DEBUG" => Level::DEBUG,
        "INFO" => Level::INFO,
        "WARN" | "WARNING" => Level::WARN,
        "ERROR" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Setup structured logging for the entire application.
/// Only the first call installs a subscriber; later calls are no-ops.
pub fn setup_logging(log_level: Option<&str>, json_format: bool) {
    let log_level_str = log_level.unwrap_or("INFO");
    let level = parse_level(log_level_str);

    INIT.call_once(|| {
        let mut filter = EnvFilter::from_default_env().add_directive(level.into());
        for target in NOISY_TARGETS {
            if let Ok(directive) = target.parse() {
                filter = filter.add_directive(directive);
            }
        }

        let result = if json_format {
            tracing_subscriber::fmt()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_env_filter(filter)
                .try_init()
        } else {
            tracing_subscriber::fmt()
                .with_target(true)
                .with_env_filter(filter)
                .try_init()
        };

        // Another subscriber may already be installed (test harnesses)
        if result.is_ok() {
            tracing::info!(log_level = %log_level_str, json = json_format, "Logging initialized");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARNING"), Level::WARN);
        assert_eq!(parse_level("nonsense"), Level::INFO);
    }

    #[test]
    fn test_setup_logging_twice() {
        setup_logging(Some("DEBUG"), false);
        setup_logging(Some("ERROR"), true);
    }
}
