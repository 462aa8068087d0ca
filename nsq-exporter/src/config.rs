//! Configuration for the NSQ exporter.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nsq_exporter_common::LoggingConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collector::canonical_name;
use crate::fetcher::normalize_url;
use crate::mapping::MetricNaming;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// nsqd connection settings.
    #[serde(default)]
    pub nsqd: NsqdConfig,

    /// Prometheus exposition settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Enabled collectors, by name or alias.
    #[serde(default = "default_collectors")]
    pub collectors: Vec<String>,

    /// Scrape behavior.
    #[serde(default)]
    pub scrape: ScrapeConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// nsqd endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NsqdConfig {
    /// Stats URL (default: "http://localhost:4151/stats").
    #[serde(default = "default_nsqd_url")]
    pub url: String,

    /// Request timeout in milliseconds (default: 5000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Optional TLS material.
    #[serde(default)]
    pub tls: TlsConfig,
}

impl NsqdConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_nsqd_url() -> String {
    "http://localhost:4151/stats".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

impl Default for NsqdConfig {
    fn default() -> Self {
        Self {
            url: default_nsqd_url(),
            timeout_ms: default_timeout_ms(),
            tls: TlsConfig::default(),
        }
    }
}

/// TLS configuration for the nsqd connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// CA certificate (PEM) used to verify nsqd.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,

    /// Client certificate (PEM).
    #[serde(default)]
    pub client_cert: Option<PathBuf>,

    /// Client private key (PEM).
    #[serde(default)]
    pub client_key: Option<PathBuf>,
}

/// Prometheus HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Address to listen on (default: "0.0.0.0:9117").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Metric name prefix (default: "nsq").
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Share families across entity classes and add a `type` label.
    #[serde(default)]
    pub type_label: bool,
}

impl PrometheusConfig {
    pub fn naming(&self) -> MetricNaming {
        MetricNaming::new(&self.namespace).with_type_label(self.type_label)
    }
}

fn default_listen() -> String {
    "0.0.0.0:9117".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

fn default_namespace() -> String {
    "nsq".to_string()
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            namespace: default_namespace(),
            type_label: false,
        }
    }
}

fn default_collectors() -> Vec<String> {
    vec!["queues".to_string(), "sub_queues".to_string()]
}

/// When collector tables are cleared during a scrape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    /// Clear before fetching; a failed fetch exposes no entity series.
    #[default]
    BeforeFetch,
    /// Clear only after a successful fetch; a failed fetch re-exposes the
    /// previous tables.
    AfterFetch,
}

/// Granularity of the duration histograms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingGranularity {
    /// One observation per scrape.
    #[default]
    Scrape,
    /// One observation per scrape plus one per collector.
    Collector,
}

/// Scrape behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeConfig {
    /// Ingest collectors on separate tasks (default: true).
    #[serde(default = "default_concurrent")]
    pub concurrent: bool,

    #[serde(default)]
    pub reset: ResetPolicy,

    #[serde(default)]
    pub timing: TimingGranularity,
}

fn default_concurrent() -> bool {
    true
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            concurrent: default_concurrent(),
            reset: ResetPolicy::default(),
            timing: TimingGranularity::default(),
        }
    }
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ExporterConfig = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nsqd.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "nsqd.timeout_ms must be > 0".to_string(),
            ));
        }

        normalize_url(&self.nsqd.url).map_err(|e| ConfigError::Validation(e.to_string()))?;

        if self.nsqd.tls.client_cert.is_some() != self.nsqd.tls.client_key.is_some() {
            return Err(ConfigError::Validation(
                "nsqd.tls.client_cert and nsqd.tls.client_key must be given together".to_string(),
            ));
        }

        // Validate listen address format
        if self
            .prometheus
            .listen
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.prometheus.listen
            )));
        }

        // Validate path starts with /
        if !self.prometheus.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if self.prometheus.namespace.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Namespace must not be empty".to_string(),
            ));
        }

        if self.collectors.is_empty() {
            return Err(ConfigError::Validation(
                "At least one collector must be enabled".to_string(),
            ));
        }

        self.logging
            .filter()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        let mut seen = HashSet::new();
        for name in &self.collectors {
            let canonical = canonical_name(name).ok_or_else(|| {
                ConfigError::Validation(format!("Unknown collector: {}", name))
            })?;
            if !seen.insert(canonical) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate collector: {} ({})",
                    name, canonical
                )));
            }
        }

        Ok(())
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            nsqd: NsqdConfig::default(),
            prometheus: PrometheusConfig::default(),
            collectors: default_collectors(),
            scrape: ScrapeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
