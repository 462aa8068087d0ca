//! Typed model of the nsqd `/stats` document.
//!
//! Field names follow nsqd's wire format (`topic_name`, `channels`,
//! `clients`, ...) and also accept the exporter's own vocabulary (`name`,
//! `sub_queues`, `consumers`, ...) as aliases. Every field is optional:
//! missing keys and JSON `null` decode to the default value, so one sparse
//! entity never fails a whole snapshot.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};

/// One point-in-time status document from the daemon.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    #[serde(deserialize_with = "null_as_default")]
    pub version: String,

    #[serde(deserialize_with = "null_as_default")]
    pub health: String,

    /// Daemon start time, Unix seconds.
    #[serde(deserialize_with = "null_as_default")]
    pub start_time: i64,

    #[serde(rename = "topics", alias = "queues", deserialize_with = "null_as_default")]
    pub queues: Vec<Queue>,
}

impl Snapshot {
    /// Total number of sub-queues across all queues.
    pub fn sub_queue_count(&self) -> usize {
        self.queues.iter().map(|q| q.sub_queues.len()).sum()
    }

    /// Total number of consumers across all sub-queues.
    pub fn consumer_count(&self) -> usize {
        self.queues
            .iter()
            .flat_map(|q| &q.sub_queues)
            .map(|s| s.consumers.len())
            .sum()
    }
}

/// A queue (nsqd topic).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Queue {
    #[serde(rename = "topic_name", alias = "name", deserialize_with = "null_as_default")]
    pub name: String,

    #[serde(deserialize_with = "null_as_default")]
    pub depth: i64,

    #[serde(deserialize_with = "null_as_default")]
    pub backend_depth: i64,

    #[serde(deserialize_with = "null_as_default")]
    pub message_count: u64,

    #[serde(deserialize_with = "null_as_default")]
    pub paused: bool,

    #[serde(rename = "e2e_processing_latency", alias = "latency_percentiles")]
    pub latency: LatencyPercentiles,

    #[serde(rename = "channels", alias = "sub_queues", deserialize_with = "null_as_default")]
    pub sub_queues: Vec<SubQueue>,
}

/// A sub-queue (nsqd channel) attached to a queue.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SubQueue {
    #[serde(rename = "channel_name", alias = "name", deserialize_with = "null_as_default")]
    pub name: String,

    #[serde(deserialize_with = "null_as_default")]
    pub depth: i64,

    #[serde(deserialize_with = "null_as_default")]
    pub backend_depth: i64,

    #[serde(deserialize_with = "null_as_default")]
    pub message_count: u64,

    #[serde(deserialize_with = "null_as_default")]
    pub in_flight_count: i64,

    #[serde(deserialize_with = "null_as_default")]
    pub deferred_count: i64,

    #[serde(deserialize_with = "null_as_default")]
    pub requeue_count: u64,

    #[serde(deserialize_with = "null_as_default")]
    pub timeout_count: u64,

    #[serde(deserialize_with = "null_as_default")]
    pub paused: bool,

    #[serde(rename = "e2e_processing_latency", alias = "latency_percentiles")]
    pub latency: LatencyPercentiles,

    #[serde(rename = "clients", alias = "consumers", deserialize_with = "null_as_default")]
    pub consumers: Vec<Consumer>,
}

/// A connected consumer (nsqd client).
///
/// The id is chosen by the client and is not unique: several connections
/// from one process commonly share it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Consumer {
    #[serde(rename = "client_id", alias = "id", deserialize_with = "null_as_default")]
    pub id: String,

    #[serde(deserialize_with = "null_as_default")]
    pub hostname: String,

    #[serde(deserialize_with = "null_as_default")]
    pub version: String,

    #[serde(deserialize_with = "null_as_default")]
    pub remote_address: String,

    /// Connection state code as reported by nsqd.
    #[serde(deserialize_with = "null_as_default")]
    pub state: i32,

    #[serde(deserialize_with = "null_as_default")]
    pub ready_count: i64,

    #[serde(deserialize_with = "null_as_default")]
    pub in_flight_count: i64,

    #[serde(deserialize_with = "null_as_default")]
    pub message_count: u64,

    #[serde(deserialize_with = "null_as_default")]
    pub finish_count: u64,

    #[serde(deserialize_with = "null_as_default")]
    pub requeue_count: u64,

    /// Connect time, Unix seconds.
    #[serde(rename = "connect_ts", alias = "connect_time", deserialize_with = "null_as_default")]
    pub connect_time: i64,

    #[serde(deserialize_with = "null_as_default")]
    pub sample_rate: i32,

    #[serde(deserialize_with = "null_as_default")]
    pub deflate: bool,

    #[serde(deserialize_with = "null_as_default")]
    pub snappy: bool,

    #[serde(deserialize_with = "null_as_default")]
    pub tls: bool,

    #[serde(deserialize_with = "null_as_default")]
    pub user_agent: String,
}

impl Consumer {
    /// Negotiated transport features of this connection.
    pub fn transport_flags(&self) -> TransportFlags {
        TransportFlags {
            deflate: self.deflate,
            snappy: self.snappy,
            tls: self.tls,
        }
    }
}

/// Transport features negotiated by a consumer connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportFlags {
    pub deflate: bool,
    pub snappy: bool,
    pub tls: bool,
}

/// Latency percentiles keyed by rank.
///
/// nsqd omits percentiles entirely when too few samples were seen, and may
/// omit single ranks, so lookups fall back to zero instead of failing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyPercentiles {
    /// Rank in basis points (0.99 -> 9900) to value.
    values: BTreeMap<u32, f64>,
}

impl LatencyPercentiles {
    /// 99th percentile rank.
    pub const P99: f64 = 0.99;
    /// 95th percentile rank.
    pub const P95: f64 = 0.95;

    /// Build from `(rank, value)` pairs. Ranks may be given either as a
    /// fraction (`0.99`) or as a percentage (`99`).
    pub fn from_pairs(pairs: impl IntoIterator<Item = (f64, f64)>) -> Self {
        let values = pairs
            .into_iter()
            .filter(|(rank, _)| rank.is_finite())
            .map(|(rank, value)| (rank_key(rank), value))
            .collect();
        Self { values }
    }

    /// Value at `rank`, if the daemon reported it.
    pub fn get(&self, rank: f64) -> Option<f64> {
        self.values.get(&rank_key(rank)).copied()
    }

    /// Value at `rank`, or zero when absent.
    pub fn value_at(&self, rank: f64) -> f64 {
        self.get(rank).unwrap_or(0.0)
    }

    /// True when the daemon reported no percentiles at all.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Ranks (as fractions) and values in ascending rank order.
    #[cfg(test)]
    fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.values
            .iter()
            .map(|(key, value)| (*key as f64 / 10_000.0, *value))
    }
}

fn rank_key(rank: f64) -> u32 {
    let fraction = if rank > 1.0 { rank / 100.0 } else { rank };
    (fraction.clamp(0.0, 1.0) * 10_000.0).round() as u32
}

#[derive(Deserialize)]
struct RawPercentile {
    #[serde(alias = "percentile", alias = "rank")]
    quantile: f64,
    #[serde(default)]
    value: f64,
}

/// nsqd reports `{"count": .., "percentiles": [..]}`; a bare list of
/// percentiles is accepted as well.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawLatency {
    List(Vec<RawPercentile>),
    Summary {
        #[serde(default, deserialize_with = "null_as_default")]
        percentiles: Vec<RawPercentile>,
    },
}

impl<'de> Deserialize<'de> for LatencyPercentiles {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = match Option::<RawLatency>::deserialize(deserializer)? {
            None => Vec::new(),
            Some(RawLatency::List(list)) => list,
            Some(RawLatency::Summary { percentiles }) => percentiles,
        };
        Ok(Self::from_pairs(raw.into_iter().map(|p| (p.quantile, p.value))))
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
