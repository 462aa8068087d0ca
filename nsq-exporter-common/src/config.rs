//! Logging configuration shared by the exporter binary and its tests.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Level names accepted as a bare `logging.level`.
const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level ("trace", "debug", "info", "warn", "error", "off"), or a
    /// directive list such as `"info,nsq_exporter=debug"`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl LoggingConfig {
    /// Build the filter for the configured level.
    ///
    /// A bare word must be a level name; otherwise `EnvFilter` would read
    /// a typo like `"verbose"` as a target and silently log nothing.
    pub fn filter(&self) -> Result<EnvFilter> {
        let level = self.level.trim();
        if level.is_empty() {
            return Err(Error::Config("Log level must not be empty".to_string()));
        }
        if !level.contains(['=', ','])
            && !LEVELS.contains(&level.to_ascii_lowercase().as_str())
        {
            return Err(Error::Config(format!("Unknown log level: {}", level)));
        }
        EnvFilter::try_new(level)
            .map_err(|e| Error::Config(format!("Invalid log filter '{}': {}", level, e)))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
