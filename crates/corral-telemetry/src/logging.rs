use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Configuration for the tracing subscriber.
#[derive(Clone, Debug)]
pub struct LoggingConfig {
    /// Default log level. Overridden by RUST_LOG.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "corral_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl LoggingConfig {
    /// Build from environment: CORRAL_LOG_JSON=1 switches to JSON output.
    pub fn from_env() -> Self {
        Self {
            json: std::env::var("CORRAL_LOG_JSON").map(|v| v == "1").unwrap_or(false),
            ..Default::default()
        }
    }

    fn filter(&self) -> EnvFilter {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str))
    }
}

/// Initialize the tracing subscriber. Call once at startup; returns false
/// if a global subscriber was already set (as in tests).
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = config.filter();
    if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_target(true)
            .with_env_filter(filter)
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_target(true)
            .with_env_filter(filter)
            .try_init()
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_info_text() {
        let config = LoggingConfig::default();
        assert_eq!(config.log_level, Level::INFO);
        assert!(!config.json);
    }

    #[test]
    fn filter_includes_module_overrides() {
        let config = LoggingConfig {
            module_levels: vec![("corral_engine".into(), Level::DEBUG)],
            ..Default::default()
        };
        // EnvFilter has no inspection API; building it without panic is the contract.
        let _ = config.filter();
    }

    #[test]
    fn repeated_init_does_not_panic() {
        let config = LoggingConfig::default();
        let first = init_logging(&config);
        let second = init_logging(&config);
        // At most one call can win the global subscriber slot.
        assert!(!(first && second));
    }
}
