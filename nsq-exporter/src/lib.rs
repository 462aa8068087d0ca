//! Prometheus metrics exporter for nsqd.
//!
//! Every Prometheus pull triggers one scrape: the exporter fetches the nsqd
//! `/stats` document, maps queues (topics), sub-queues (channels) and
//! consumers (clients) to labeled gauges, and serves them with its own
//! scrape-duration histograms.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  nsqd /stats    │<────│    Executor     │<────│   HTTP Server   │
//! │  (JSON)         │     │  (collectors)   │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! Run the exporter binary with a configuration file:
//!
//! ```bash
//! nsq-exporter --config config.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod collector;
pub mod config;
pub mod executor;
pub mod fetcher;
pub mod http;
pub mod mapping;
pub mod sink;

pub use collector::{Collect, StatsCollector};
pub use config::ExporterConfig;
pub use executor::{Executor, ScrapeOutcome};
pub use fetcher::SnapshotFetcher;
pub use http::HttpServer;
pub use sink::MetricSink;
