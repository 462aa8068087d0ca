//! Per-scrape metric sink.
//!
//! Collectors emit gauge samples into a fresh sink on every scrape. The sink
//! groups samples by family name and renders them in the text exposition
//! format, families sorted by name.

use std::collections::BTreeMap;
use std::fmt::Write;

/// Description of one gauge family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDesc {
    pub name: String,
    pub help: &'static str,
    pub labels: Vec<&'static str>,
}

/// One labeled value.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: Vec<(&'static str, String)>,
    pub value: f64,
}

#[derive(Debug, Default)]
struct Family {
    help: String,
    samples: Vec<Sample>,
}

/// Accumulates gauge families for a single scrape.
#[derive(Debug, Default)]
pub struct MetricSink {
    families: BTreeMap<String, Family>,
}

impl MetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a family. The first help text wins when several entity
    /// classes share a family.
    pub fn describe(&mut self, name: &str, help: &str) {
        self.families
            .entry(name.to_string())
            .or_insert_with(|| Family {
                help: help.to_string(),
                samples: Vec::new(),
            });
    }

    /// Add a sample to a family, declaring it with empty help if needed.
    pub fn add(&mut self, name: &str, labels: Vec<(&'static str, String)>, value: f64) {
        self.families
            .entry(name.to_string())
            .or_default()
            .samples
            .push(Sample { labels, value });
    }

    /// Look up a sample by exact label set, in any order.
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let family = self.families.get(name)?;
        family
            .samples
            .iter()
            .find(|sample| {
                sample.labels.len() == labels.len()
                    && labels.iter().all(|(k, v)| {
                        sample
                            .labels
                            .iter()
                            .any(|(sk, sv)| sk == k && sv.as_str() == *v)
                    })
            })
            .map(|sample| sample.value)
    }

    /// Samples of one family, in emission order.
    pub fn samples(&self, name: &str) -> &[Sample] {
        self.families
            .get(name)
            .map(|family| family.samples.as_slice())
            .unwrap_or_default()
    }

    /// Names of families holding at least one sample.
    pub fn family_names(&self) -> impl Iterator<Item = &str> {
        self.families
            .iter()
            .filter(|(_, family)| !family.samples.is_empty())
            .map(|(name, _)| name.as_str())
    }

    /// Total number of samples.
    pub fn series_count(&self) -> usize {
        self.families.values().map(|f| f.samples.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.series_count() == 0
    }

    /// Render all non-empty families in the text exposition format.
    pub fn render(&self) -> String {
        let mut output = String::with_capacity(self.series_count() * 100);
        self.render_into(&mut output);
        output
    }

    /// Append the rendered families to `output`.
    pub fn render_into(&self, output: &mut String) {
        for (name, family) in &self.families {
            if family.samples.is_empty() {
                continue;
            }

            if !family.help.is_empty() {
                writeln!(output, "# HELP {} {}", name, escape_help(&family.help)).ok();
            }
            writeln!(output, "# TYPE {} gauge", name).ok();

            for sample in &family.samples {
                writeln!(
                    output,
                    "{}{} {}",
                    name,
                    format_labels(&sample.labels),
                    format_value(sample.value)
                )
                .ok();
            }
        }
    }
}

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Format a float value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

/// Format labels for Prometheus exposition format.
fn format_labels(labels: &[(&'static str, String)]) -> String {
    if labels.is_empty() {
        return String::new();
    }

    let parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();

    format!("{{{}}}", parts.join(","))
}
