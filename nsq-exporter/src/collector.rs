//! Stats collectors.
//!
//! A collector owns a label table for one entity class: label values of
//! every entity seen since the last reset, each mapped to one value per
//! field. Ingesting a snapshot upserts rows; emitting writes every row
//! into a [`MetricSink`]. Rows only disappear on reset, so whether stale
//! rows survive a failed scrape is decided by when the executor resets.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use nsq_exporter_common::{Error, Result, Snapshot};

use crate::mapping::{
    ConsumerStats, EntityClass, MetricNaming, QueueStats, SubQueueStats, TYPE_LABEL,
};
use crate::sink::{MetricDesc, MetricSink};

/// Label values of one entity, in schema order.
pub type LabelValues = Vec<String>;

/// Rows of one entity class, keyed by label values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelTable {
    rows: BTreeMap<LabelValues, Vec<f64>>,
}

impl LabelTable {
    /// Insert or overwrite the row for `labels`.
    pub fn upsert(&mut self, labels: LabelValues, values: Vec<f64>) {
        self.rows.insert(labels, values);
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    #[cfg(test)]
    fn get(&self, labels: &[&str]) -> Option<&[f64]> {
        let key: LabelValues = labels.iter().map(|s| s.to_string()).collect();
        self.rows.get(&key).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LabelValues, &[f64])> {
        self.rows.iter().map(|(k, v)| (k, v.as_slice()))
    }
}

/// Operations every stats collector supports.
pub trait Collect {
    /// Configuration name of the collector.
    fn name(&self) -> &'static str;

    /// Forget every row.
    fn reset(&mut self);

    /// Upsert one row per entity found in `snapshot`.
    fn ingest(&mut self, snapshot: &Snapshot);

    /// Write every row into `sink`. Does not modify the table.
    fn emit(&self, sink: &mut MetricSink);

    /// Families this collector emits.
    fn describe(&self) -> Vec<MetricDesc>;
}

/// Collector for one entity class.
#[derive(Debug)]
pub struct EntityCollector<C: EntityClass> {
    naming: MetricNaming,
    table: LabelTable,
    _class: PhantomData<fn() -> C>,
}

impl<C: EntityClass> EntityCollector<C> {
    pub fn new(naming: MetricNaming) -> Self {
        Self {
            naming,
            table: LabelTable::default(),
            _class: PhantomData,
        }
    }

    pub fn table(&self) -> &LabelTable {
        &self.table
    }

    fn label_names(&self) -> Vec<&'static str> {
        let mut names = Vec::with_capacity(C::LABELS.len() + 1);
        if self.naming.type_label() {
            names.push(TYPE_LABEL);
        }
        names.extend_from_slice(C::LABELS);
        names
    }
}

impl<C: EntityClass> Collect for EntityCollector<C> {
    fn name(&self) -> &'static str {
        C::COLLECTOR
    }

    fn reset(&mut self) {
        self.table.clear();
    }

    fn ingest(&mut self, snapshot: &Snapshot) {
        let fields = C::fields();
        let table = &mut self.table;
        C::for_each(snapshot, |labels, entity| {
            let values = fields.iter().map(|field| (field.value)(entity)).collect();
            table.upsert(labels, values);
        });
    }

    fn emit(&self, sink: &mut MetricSink) {
        let descs = self.describe();
        for desc in &descs {
            sink.describe(&desc.name, desc.help);
        }

        for (values, row) in self.table.iter() {
            let mut labels = Vec::with_capacity(values.len() + 1);
            if self.naming.type_label() {
                labels.push((TYPE_LABEL, C::ENTITY.to_string()));
            }
            labels.extend(C::LABELS.iter().copied().zip(values.iter().cloned()));

            for (desc, value) in descs.iter().zip(row) {
                sink.add(&desc.name, labels.clone(), *value);
            }
        }
    }

    fn describe(&self) -> Vec<MetricDesc> {
        let labels = self.label_names();
        C::fields()
            .iter()
            .map(|field| MetricDesc {
                name: self.naming.entity_metric(C::ENTITY, field.name),
                help: field.help,
                labels: labels.clone(),
            })
            .collect()
    }
}

/// The closed set of stats collectors.
#[derive(Debug)]
pub enum StatsCollector {
    Queues(EntityCollector<QueueStats>),
    SubQueues(EntityCollector<SubQueueStats>),
    Consumers(EntityCollector<ConsumerStats>),
}

type Constructor = fn(MetricNaming) -> StatsCollector;

/// Collector name, accepted aliases, constructor.
const COLLECTORS: &[(&str, &[&str], Constructor)] = &[
    ("queues", &["topics"], |naming| {
        StatsCollector::Queues(EntityCollector::new(naming))
    }),
    ("sub_queues", &["channels"], |naming| {
        StatsCollector::SubQueues(EntityCollector::new(naming))
    }),
    ("consumers", &["clients"], |naming| {
        StatsCollector::Consumers(EntityCollector::new(naming))
    }),
];

fn lookup(name: &str) -> Option<&'static (&'static str, &'static [&'static str], Constructor)> {
    let name = name.trim();
    let name = name.strip_prefix("stats.").unwrap_or(name);
    COLLECTORS
        .iter()
        .find(|(canonical, aliases, _)| *canonical == name || aliases.contains(&name))
}

/// Resolve a configured collector name or alias to its canonical name.
pub fn canonical_name(name: &str) -> Option<&'static str> {
    lookup(name).map(|(canonical, _, _)| *canonical)
}

/// Canonical names of every known collector.
pub fn available_collectors() -> impl Iterator<Item = &'static str> {
    COLLECTORS.iter().map(|(name, _, _)| *name)
}

impl StatsCollector {
    /// Build a collector from a configured name or alias.
    pub fn from_name(name: &str, naming: MetricNaming) -> Result<Self> {
        let (_, _, constructor) = lookup(name).ok_or_else(|| {
            Error::Config(format!(
                "unknown collector '{}', expected one of: {}",
                name,
                available_collectors().collect::<Vec<_>>().join(", ")
            ))
        })?;
        Ok(constructor(naming))
    }

    /// Number of rows currently held.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn table(&self) -> &LabelTable {
        match self {
            StatsCollector::Queues(c) => c.table(),
            StatsCollector::SubQueues(c) => c.table(),
            StatsCollector::Consumers(c) => c.table(),
        }
    }

    fn as_collect(&self) -> &dyn Collect {
        match self {
            StatsCollector::Queues(c) => c,
            StatsCollector::SubQueues(c) => c,
            StatsCollector::Consumers(c) => c,
        }
    }

    fn as_collect_mut(&mut self) -> &mut dyn Collect {
        match self {
            StatsCollector::Queues(c) => c,
            StatsCollector::SubQueues(c) => c,
            StatsCollector::Consumers(c) => c,
        }
    }
}

impl Collect for StatsCollector {
    fn name(&self) -> &'static str {
        self.as_collect().name()
    }

    fn reset(&mut self) {
        self.as_collect_mut().reset()
    }

    fn ingest(&mut self, snapshot: &Snapshot) {
        self.as_collect_mut().ingest(snapshot)
    }

    fn emit(&self, sink: &mut MetricSink) {
        self.as_collect().emit(sink)
    }

    fn describe(&self) -> Vec<MetricDesc> {
        self.as_collect().describe()
    }
}
