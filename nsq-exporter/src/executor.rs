//! Scrape execution.
//!
//! One scrape is one fetch, one pass per registered collector and the
//! self-observation metrics. Scrapes are serialized; within a scrape the
//! collectors may ingest in parallel.
//!
//! Each scrape takes a new generation number before it resets anything.
//! Ingest tasks carry the generation they were spawned for and check it
//! under the collector lock, so a task left over from a dropped scrape can
//! never write into a table that a later scrape has already reset.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use nsq_exporter_common::{Result, Snapshot};
use parking_lot::{Mutex, RwLock};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::collector::{Collect, StatsCollector};
use crate::config::{ExporterConfig, ResetPolicy, ScrapeConfig, TimingGranularity};
use crate::fetcher::SnapshotFetcher;
use crate::mapping::MetricNaming;
use crate::sink::{MetricDesc, MetricSink};

/// Result of one scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeOutcome {
    Success,
    Error,
}

impl ScrapeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeOutcome::Success => "success",
            ScrapeOutcome::Error => "error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ScrapeOutcome::Success)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ScrapeLabels {
    result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CollectorLabels {
    collector: String,
    result: String,
}

fn duration_histogram() -> Histogram {
    // 1ms .. ~8s
    Histogram::new(exponential_buckets(0.001, 2.0, 14))
}

/// Self-observation metrics, registered in the exposition registry.
#[derive(Debug)]
struct ScrapeMetrics {
    scrape_duration: Family<ScrapeLabels, Histogram>,
    collector_duration: Family<CollectorLabels, Histogram>,
    series: Gauge,
}

impl ScrapeMetrics {
    fn register(registry: &mut Registry, timing: TimingGranularity) -> Self {
        let scrape_duration: Family<ScrapeLabels, Histogram> =
            Family::new_with_constructor(duration_histogram);
        registry.register(
            "exporter_scrape_duration_seconds",
            "Duration of a scrape of nsqd",
            scrape_duration.clone(),
        );

        let collector_duration: Family<CollectorLabels, Histogram> =
            Family::new_with_constructor(duration_histogram);
        if timing == TimingGranularity::Collector {
            registry.register(
                "exporter_collector_duration_seconds",
                "Duration of one collector's ingest and emit passes",
                collector_duration.clone(),
            );
        }

        let series = Gauge::default();
        registry.register(
            "exporter_series",
            "Number of samples emitted by the last scrape",
            series.clone(),
        );

        Self {
            scrape_duration,
            collector_duration,
            series,
        }
    }

    fn observe_scrape(&self, outcome: ScrapeOutcome, elapsed: Duration) {
        self.scrape_duration
            .get_or_create(&ScrapeLabels {
                result: outcome.as_str().to_string(),
            })
            .observe(elapsed.as_secs_f64());
    }

    fn observe_collector(&self, collector: &str, outcome: ScrapeOutcome, elapsed: Duration) {
        self.collector_duration
            .get_or_create(&CollectorLabels {
                collector: collector.to_string(),
                result: outcome.as_str().to_string(),
            })
            .observe(elapsed.as_secs_f64());
    }
}

struct Registered {
    name: &'static str,
    collector: Arc<Mutex<StatsCollector>>,
}

/// Runs scrapes against one nsqd.
pub struct Executor {
    fetcher: SnapshotFetcher,
    naming: MetricNaming,
    scrape: ScrapeConfig,
    collectors: Vec<Registered>,
    metrics: ScrapeMetrics,
    scrape_lock: tokio::sync::Mutex<()>,
    generation: Arc<AtomicU64>,
    last_outcome: RwLock<Option<ScrapeOutcome>>,
}

impl Executor {
    /// Create an executor with no collectors. Self-observation metrics are
    /// registered in `registry`.
    pub fn new(
        fetcher: SnapshotFetcher,
        naming: MetricNaming,
        scrape: ScrapeConfig,
        registry: &mut Registry,
    ) -> Self {
        let metrics = ScrapeMetrics::register(registry, scrape.timing);
        Self {
            fetcher,
            naming,
            scrape,
            collectors: Vec::new(),
            metrics,
            scrape_lock: tokio::sync::Mutex::new(()),
            generation: Arc::new(AtomicU64::new(0)),
            last_outcome: RwLock::new(None),
        }
    }

    /// Create an executor with the fetcher and collectors named in `config`.
    pub fn from_config(config: &ExporterConfig, registry: &mut Registry) -> Result<Self> {
        let fetcher = SnapshotFetcher::from_config(&config.nsqd)?;
        let naming = config.prometheus.naming();
        let mut executor = Self::new(fetcher, naming.clone(), config.scrape.clone(), registry);
        for name in &config.collectors {
            executor.use_collector(StatsCollector::from_name(name, naming.clone())?);
        }
        Ok(executor)
    }

    /// Register a collector. Collectors are never removed.
    pub fn use_collector(&mut self, collector: StatsCollector) {
        self.collectors.push(Registered {
            name: collector.name(),
            collector: Arc::new(Mutex::new(collector)),
        });
    }

    pub fn collector_names(&self) -> Vec<&'static str> {
        self.collectors.iter().map(|r| r.name).collect()
    }

    pub fn fetcher(&self) -> &SnapshotFetcher {
        &self.fetcher
    }

    /// Outcome of the most recent scrape, if any.
    pub fn last_outcome(&self) -> Option<ScrapeOutcome> {
        *self.last_outcome.read()
    }

    /// Gauge families emitted into the sink by a successful scrape.
    pub fn describe(&self) -> Vec<MetricDesc> {
        let mut descs: Vec<MetricDesc> = self
            .collectors
            .iter()
            .flat_map(|r| r.collector.lock().describe())
            .collect();
        descs.push(MetricDesc {
            name: self.naming.daemon_metric("queues_total"),
            help: QUEUES_TOTAL_HELP,
            labels: Vec::new(),
        });
        descs.push(MetricDesc {
            name: self.naming.daemon_metric("info"),
            help: INFO_HELP,
            labels: vec!["version", "health"],
        });
        descs
    }

    /// Run one scrape and emit its samples into `sink`.
    ///
    /// Fetch failures are logged and reported as [`ScrapeOutcome::Error`];
    /// they never fail the caller.
    pub async fn scrape(&self, sink: &mut MetricSink) -> ScrapeOutcome {
        let _guard = self.scrape_lock.lock().await;
        let start = Instant::now();
        let series_before = sink.series_count();
        let generation = self.next_generation();

        if self.scrape.reset == ResetPolicy::BeforeFetch {
            self.reset_all();
        }

        let outcome = match self.fetcher.fetch().await {
            Ok(snapshot) => {
                if self.scrape.reset == ResetPolicy::AfterFetch {
                    self.reset_all();
                }

                let snapshot = Arc::new(snapshot);
                let ingest_times = self.ingest_all(&snapshot, generation).await;
                let emit_times = self.emit_all(sink);
                self.emit_daemon_series(sink, &snapshot);

                if self.scrape.timing == TimingGranularity::Collector {
                    for ((registered, ingest), emit) in
                        self.collectors.iter().zip(ingest_times).zip(emit_times)
                    {
                        self.metrics.observe_collector(
                            registered.name,
                            ScrapeOutcome::Success,
                            ingest + emit,
                        );
                    }
                }

                debug!(
                    queues = snapshot.queues.len(),
                    sub_queues = snapshot.sub_queue_count(),
                    consumers = snapshot.consumer_count(),
                    series = sink.series_count() - series_before,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Scrape completed"
                );
                ScrapeOutcome::Success
            }
            Err(e) => {
                warn!(
                    url = %self.fetcher.url(),
                    kind = e.kind(),
                    error = %e,
                    "Failed to fetch nsqd stats"
                );

                // Tables are empty under before_fetch; under after_fetch
                // this re-exposes the previous scrape.
                let emit_times = self.emit_all(sink);

                if self.scrape.timing == TimingGranularity::Collector {
                    let fetch_time = start.elapsed();
                    for (registered, emit) in self.collectors.iter().zip(emit_times) {
                        self.metrics.observe_collector(
                            registered.name,
                            ScrapeOutcome::Error,
                            fetch_time + emit,
                        );
                    }
                }
                ScrapeOutcome::Error
            }
        };

        self.metrics.observe_scrape(outcome, start.elapsed());
        self.metrics
            .series
            .set((sink.series_count() - series_before) as i64);
        *self.last_outcome.write() = Some(outcome);

        outcome
    }

    /// Start a new scrape generation. Must run before any reset.
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn reset_all(&self) {
        for registered in &self.collectors {
            registered.collector.lock().reset();
        }
    }

    /// Ingest `snapshot` into every collector and return each pass duration.
    ///
    /// Dropping the returned future aborts ingest tasks that have not
    /// started yet; tasks already holding a collector lock run to the end.
    async fn ingest_all(&self, snapshot: &Arc<Snapshot>, generation: u64) -> Vec<Duration> {
        if !self.scrape.concurrent {
            return self
                .collectors
                .iter()
                .map(|registered| {
                    let start = Instant::now();
                    registered.collector.lock().ingest(snapshot);
                    start.elapsed()
                })
                .collect();
        }

        let mut tasks = JoinSet::new();
        for (index, registered) in self.collectors.iter().enumerate() {
            let collector = Arc::clone(&registered.collector);
            let current = Arc::clone(&self.generation);
            let snapshot = Arc::clone(snapshot);
            tasks.spawn(async move {
                let start = Instant::now();
                let mut collector = collector.lock();
                if current.load(Ordering::SeqCst) != generation {
                    debug!(
                        collector = collector.name(),
                        generation, "Skipping ingest for a superseded scrape"
                    );
                    return (index, Duration::ZERO);
                }
                collector.ingest(&snapshot);
                (index, start.elapsed())
            });
        }

        let mut durations = vec![Duration::ZERO; self.collectors.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, elapsed)) => durations[index] = elapsed,
                Err(e) => error!(error = %e, "Ingest task failed"),
            }
        }
        durations
    }

    /// Emit every collector serially and return each pass duration.
    fn emit_all(&self, sink: &mut MetricSink) -> Vec<Duration> {
        self.collectors
            .iter()
            .map(|registered| {
                let start = Instant::now();
                registered.collector.lock().emit(sink);
                start.elapsed()
            })
            .collect()
    }

    fn emit_daemon_series(&self, sink: &mut MetricSink, snapshot: &Snapshot) {
        let queues_total = self.naming.daemon_metric("queues_total");
        sink.describe(&queues_total, QUEUES_TOTAL_HELP);
        sink.add(&queues_total, Vec::new(), snapshot.queues.len() as f64);

        let info = self.naming.daemon_metric("info");
        sink.describe(&info, INFO_HELP);
        sink.add(
            &info,
            vec![
                ("version", snapshot.version.clone()),
                ("health", snapshot.health.clone()),
            ],
            1.0,
        );
    }
}

const QUEUES_TOTAL_HELP: &str = "Total number of queues";
const INFO_HELP: &str = "nsqd version and health";
