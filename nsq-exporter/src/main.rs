//! Prometheus exporter for nsqd.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use prometheus_client::registry::Registry;
use tokio::sync::watch;
use tracing::{debug, error, info};

use nsq_exporter::{Executor, ExporterConfig, HttpServer};

/// Prometheus exporter for nsqd.
#[derive(Parser, Debug)]
#[command(name = "nsq-exporter")]
#[command(about = "Export nsqd statistics as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Metrics path (overrides config).
    #[arg(long)]
    path: Option<String>,

    /// nsqd stats URL (overrides config).
    #[arg(long)]
    nsqd_url: Option<String>,

    /// Metric namespace (overrides config).
    #[arg(long)]
    namespace: Option<String>,

    /// Comma separated collectors (overrides config).
    #[arg(long, value_delimiter = ',')]
    collect: Option<Vec<String>>,

    /// CA certificate for the nsqd connection.
    #[arg(long)]
    tls_ca_cert: Option<PathBuf>,

    /// Client certificate for the nsqd connection.
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Client private key for the nsqd connection.
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Apply command line overrides on top of the file configuration.
    fn apply(self, config: &mut ExporterConfig) {
        if let Some(listen) = self.listen {
            config.prometheus.listen = listen;
        }
        if let Some(path) = self.path {
            config.prometheus.path = path;
        }
        if let Some(url) = self.nsqd_url {
            config.nsqd.url = url;
        }
        if let Some(namespace) = self.namespace {
            config.prometheus.namespace = namespace;
        }
        if let Some(collect) = self.collect {
            config.collectors = collect
                .into_iter()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect();
        }
        if let Some(ca_cert) = self.tls_ca_cert {
            config.nsqd.tls.ca_cert = Some(ca_cert);
        }
        if let Some(cert) = self.tls_cert {
            config.nsqd.tls.client_cert = Some(cert);
        }
        if let Some(key) = self.tls_key {
            config.nsqd.tls.client_key = Some(key);
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        ExporterConfig::load_from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path))?
    } else {
        ExporterConfig::default()
    };

    args.apply(&mut config);
    config.validate()?;

    nsq_exporter_common::init_tracing(&config.logging)?;

    info!("Starting NSQ Exporter");

    let naming = config.prometheus.naming();
    let mut registry = Registry::with_prefix(naming.namespace());
    let executor = Executor::from_config(&config, &mut registry)?;

    info!(
        nsqd = %executor.fetcher().url(),
        collectors = ?executor.collector_names(),
        namespace = naming.namespace(),
        "Exporter configured"
    );
    for desc in executor.describe() {
        debug!(metric = %desc.name, labels = ?desc.labels, "Exporting");
    }

    // Parse listen address
    let listen_addr: SocketAddr = config
        .prometheus
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_server = HttpServer::new(
        Arc::new(executor),
        Arc::new(registry),
        listen_addr,
        config.prometheus.path.clone(),
    );

    // Start HTTP server
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(shutdown_rx).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    // Signal shutdown
    shutdown_tx.send(true)?;

    // Wait for the server to drain
    let _ = tokio::time::timeout(Duration::from_secs(5), http_task).await;

    info!("Exporter stopped");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
