//! Mapping from snapshot entities to labeled gauge values.
//!
//! Each entity class (queue, sub-queue, consumer) is a fixed label schema
//! plus a table of `(field, help, extractor)` entries. Label values are
//! computed once per entity and shared by every field of that entity.

use nsq_exporter_common::{Consumer, LatencyPercentiles, Queue, Snapshot, SubQueue};

/// Label added in front of every sample when families are shared across
/// entity classes.
pub const TYPE_LABEL: &str = "type";

/// One exported field of an entity class.
pub struct Field<E> {
    /// Field suffix of the metric name.
    pub name: &'static str,
    /// `# HELP` text.
    pub help: &'static str,
    /// Extractor. Must not fail: absent data maps to zero.
    pub value: fn(&E) -> f64,
}

/// A class of entities found in a snapshot.
pub trait EntityClass: Send + Sync + 'static {
    type Entity;

    /// Collector name used in configuration and log fields.
    const COLLECTOR: &'static str;

    /// Entity name used in metric names and as the `type` label value.
    const ENTITY: &'static str;

    /// Label names, in the order `for_each` produces label values.
    const LABELS: &'static [&'static str];

    /// The exported fields.
    fn fields() -> &'static [Field<Self::Entity>];

    /// Call `visit` once per entity of this class with its label values.
    fn for_each(snapshot: &Snapshot, visit: impl FnMut(Vec<String>, &Self::Entity));
}

/// Queue-level statistics (nsqd topics).
#[derive(Debug)]
pub struct QueueStats;

/// Sub-queue-level statistics (nsqd channels).
#[derive(Debug)]
pub struct SubQueueStats;

/// Consumer-level statistics (nsqd clients).
#[derive(Debug)]
pub struct ConsumerStats;

const QUEUE_FIELDS: &[Field<Queue>] = &[
    Field {
        name: "sub_queue_count",
        help: "Number of sub-queues attached to the queue",
        value: |q| q.sub_queues.len() as f64,
    },
    Field {
        name: "depth",
        help: "Queue depth",
        value: |q| q.depth as f64,
    },
    Field {
        name: "backend_depth",
        help: "Queue backend depth",
        value: |q| q.backend_depth as f64,
    },
    Field {
        name: "message_count",
        help: "Queue message count",
        value: |q| q.message_count as f64,
    },
    Field {
        name: "e2e_latency_p99",
        help: "99th percentile end-to-end processing latency of the queue in nanoseconds",
        value: |q| q.latency.value_at(LatencyPercentiles::P99),
    },
    Field {
        name: "e2e_latency_p95",
        help: "95th percentile end-to-end processing latency of the queue in nanoseconds",
        value: |q| q.latency.value_at(LatencyPercentiles::P95),
    },
];

const SUB_QUEUE_FIELDS: &[Field<SubQueue>] = &[
    Field {
        name: "consumer_count",
        help: "Number of consumers connected to the sub-queue",
        value: |s| s.consumers.len() as f64,
    },
    Field {
        name: "depth",
        help: "Sub-queue depth",
        value: |s| s.depth as f64,
    },
    Field {
        name: "backend_depth",
        help: "Sub-queue backend depth",
        value: |s| s.backend_depth as f64,
    },
    Field {
        name: "message_count",
        help: "Sub-queue message count",
        value: |s| s.message_count as f64,
    },
    Field {
        name: "in_flight_count",
        help: "In flight count",
        value: |s| s.in_flight_count as f64,
    },
    Field {
        name: "deferred_count",
        help: "Deferred count",
        value: |s| s.deferred_count as f64,
    },
    Field {
        name: "requeue_count",
        help: "Requeue count",
        value: |s| s.requeue_count as f64,
    },
    Field {
        name: "timeout_count",
        help: "Timeout count",
        value: |s| s.timeout_count as f64,
    },
    Field {
        name: "e2e_latency_p99",
        help: "99th percentile end-to-end processing latency of the sub-queue in nanoseconds",
        value: |s| s.latency.value_at(LatencyPercentiles::P99),
    },
    Field {
        name: "e2e_latency_p95",
        help: "95th percentile end-to-end processing latency of the sub-queue in nanoseconds",
        value: |s| s.latency.value_at(LatencyPercentiles::P95),
    },
];

const CONSUMER_FIELDS: &[Field<Consumer>] = &[
    // Raw nsqd state code; mapping to names is left to dashboards.
    Field {
        name: "state",
        help: "State of consumer",
        value: |c| c.state as f64,
    },
    Field {
        name: "finish_count",
        help: "Finish count",
        value: |c| c.finish_count as f64,
    },
    Field {
        name: "message_count",
        help: "Consumer message count",
        value: |c| c.message_count as f64,
    },
    Field {
        name: "ready_count",
        help: "Ready count",
        value: |c| c.ready_count as f64,
    },
    Field {
        name: "in_flight_count",
        help: "In flight count",
        value: |c| c.in_flight_count as f64,
    },
    Field {
        name: "requeue_count",
        help: "Requeue count",
        value: |c| c.requeue_count as f64,
    },
    Field {
        name: "connect_ts",
        help: "Connect timestamp",
        value: |c| c.connect_time as f64,
    },
    Field {
        name: "sample_rate",
        help: "Sample rate",
        value: |c| c.sample_rate as f64,
    },
];

impl EntityClass for QueueStats {
    type Entity = Queue;

    const COLLECTOR: &'static str = "queues";
    const ENTITY: &'static str = "queue";
    const LABELS: &'static [&'static str] = &["queue", "paused"];

    fn fields() -> &'static [Field<Queue>] {
        QUEUE_FIELDS
    }

    fn for_each(snapshot: &Snapshot, mut visit: impl FnMut(Vec<String>, &Queue)) {
        for queue in &snapshot.queues {
            visit(vec![queue.name.clone(), queue.paused.to_string()], queue);
        }
    }
}

impl EntityClass for SubQueueStats {
    type Entity = SubQueue;

    const COLLECTOR: &'static str = "sub_queues";
    const ENTITY: &'static str = "sub_queue";
    const LABELS: &'static [&'static str] = &["queue", "sub_queue", "paused"];

    fn fields() -> &'static [Field<SubQueue>] {
        SUB_QUEUE_FIELDS
    }

    fn for_each(snapshot: &Snapshot, mut visit: impl FnMut(Vec<String>, &SubQueue)) {
        for queue in &snapshot.queues {
            for sub_queue in &queue.sub_queues {
                visit(
                    vec![
                        queue.name.clone(),
                        sub_queue.name.clone(),
                        sub_queue.paused.to_string(),
                    ],
                    sub_queue,
                );
            }
        }
    }
}

impl EntityClass for ConsumerStats {
    type Entity = Consumer;

    const COLLECTOR: &'static str = "consumers";
    const ENTITY: &'static str = "consumer";
    // The client id alone is not unique; the full tuple is the identity.
    const LABELS: &'static [&'static str] = &[
        "queue",
        "sub_queue",
        "deflate",
        "snappy",
        "tls",
        "client_id",
        "hostname",
        "version",
        "remote_address",
    ];

    fn fields() -> &'static [Field<Consumer>] {
        CONSUMER_FIELDS
    }

    fn for_each(snapshot: &Snapshot, mut visit: impl FnMut(Vec<String>, &Consumer)) {
        for queue in &snapshot.queues {
            for sub_queue in &queue.sub_queues {
                for consumer in &sub_queue.consumers {
                    let flags = consumer.transport_flags();
                    visit(
                        vec![
                            queue.name.clone(),
                            sub_queue.name.clone(),
                            flags.deflate.to_string(),
                            flags.snappy.to_string(),
                            flags.tls.to_string(),
                            consumer.id.clone(),
                            consumer.hostname.clone(),
                            consumer.version.clone(),
                            consumer.remote_address.clone(),
                        ],
                        consumer,
                    );
                }
            }
        }
    }
}

/// How metric families are named.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricNaming {
    namespace: String,
    type_label: bool,
}

impl MetricNaming {
    /// `<namespace>_<entity>_<field>` naming.
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: sanitize_metric_name(namespace),
            type_label: false,
        }
    }

    /// Share one `<namespace>_<field>` family across entity classes and
    /// tell them apart with a `type` label.
    pub fn with_type_label(mut self, enabled: bool) -> Self {
        self.type_label = enabled;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn type_label(&self) -> bool {
        self.type_label
    }

    /// Family name of `field` for the given entity class.
    pub fn entity_metric(&self, entity: &str, field: &str) -> String {
        if self.type_label {
            build_metric_name(&self.namespace, None, field)
        } else {
            build_metric_name(&self.namespace, Some(entity), field)
        }
    }

    /// Family name of a snapshot-level metric.
    pub fn daemon_metric(&self, field: &str) -> String {
        build_metric_name(&self.namespace, None, field)
    }
}

/// Sanitize a metric name to be Prometheus-compatible.
///
/// Prometheus metric names must match `[a-zA-Z_:][a-zA-Z0-9_:]*`.
/// This function:
/// - Replaces invalid characters with underscores
/// - Ensures the name starts with a letter or underscore
/// - Collapses multiple underscores into one
pub fn sanitize_metric_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len() + 1);
    let mut last_was_underscore = false;
    let mut chars = name.chars().peekable();

    // A leading digit gets an underscore in front
    if let Some(&first) = chars.peek()
        && first.is_ascii_digit()
    {
        result.push('_');
        last_was_underscore = true;
    }

    for c in chars {
        let is_valid_char = c.is_ascii_alphanumeric() || c == '_' || c == ':';

        if is_valid_char {
            if c == '_' {
                if !last_was_underscore {
                    result.push(c);
                    last_was_underscore = true;
                }
            } else {
                result.push(c);
                last_was_underscore = false;
            }
        } else if !last_was_underscore {
            result.push('_');
            last_was_underscore = true;
        }
    }

    while result.ends_with('_') {
        result.pop();
    }

    if result.is_empty() {
        result.push_str("unnamed");
    }

    result
}

/// Build a full metric name from components.
///
/// Format: `{namespace}_{entity}_{field}`, or `{namespace}_{field}` without
/// an entity.
pub fn build_metric_name(namespace: &str, entity: Option<&str>, field: &str) -> String {
    match (namespace.is_empty(), entity) {
        (true, None) => field.to_string(),
        (true, Some(entity)) => format!("{}_{}", entity, field),
        (false, None) => format!("{}_{}", namespace, field),
        (false, Some(entity)) => format!("{}_{}_{}", namespace, entity, field),
    }
}
