//--------------------------------------------------------------------------------------------------
// STRUCTS & TRAITS
//--------------------------------------------------------------------------------------------------
// | Name                    | Description                                       | Key Methods       |
// |-------------------------|---------------------------------------------------|-------------------|
// | MetricsSink             | Counter and histogram updates keyed by name/tags  | increment_counter |
// | RecorderMetrics         | Sink forwarding to the global `metrics` recorder  |                   |
// | InMemoryMetrics         | Sink keeping values for inspection                | counter           |
//--------------------------------------------------------------------------------------------------

use std::{collections::HashMap, time::Duration};

use ::metrics::{Label, counter, histogram};
use parking_lot::Mutex;
use tracing::debug;

pub type Tags<'a> = &'a [(&'a str, &'a str)];

/// Destination for counter and histogram updates
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, tags: Tags<'_>);

    fn record_duration(&self, name: &str, duration: Duration, tags: Tags<'_>);
}

/// Forwards updates to whichever `metrics` recorder the binary installed
///
/// Durations are recorded in seconds. Without an installed recorder the updates are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderMetrics;

impl MetricsSink for RecorderMetrics {
    fn increment_counter(&self, name: &str, tags: Tags<'_>) {
        counter!(name.to_owned(), to_labels(tags)).increment(1);
        debug!(metric = name, tags = %format_tags(tags), "counter incremented");
    }

    fn record_duration(&self, name: &str, duration: Duration, tags: Tags<'_>) {
        histogram!(name.to_owned(), to_labels(tags)).record(duration.as_secs_f64());
    }
}

fn to_labels(tags: Tags<'_>) -> Vec<Label> {
    tags.iter()
        .map(|(key, value)| Label::new(key.to_string(), value.to_string()))
        .collect()
}

/// Keeps every update in memory, keyed by name and tags
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    durations: Mutex<HashMap<String, Vec<Duration>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str, tags: Tags<'_>) -> u64 {
        self.counters
            .lock()
            .get(&metric_key(name, tags))
            .copied()
            .unwrap_or(0)
    }

    pub fn durations(&self, name: &str, tags: Tags<'_>) -> Vec<Duration> {
        self.durations
            .lock()
            .get(&metric_key(name, tags))
            .cloned()
            .unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &str, tags: Tags<'_>) {
        *self.counters.lock().entry(metric_key(name, tags)).or_default() += 1;
    }

    fn record_duration(&self, name: &str, duration: Duration, tags: Tags<'_>) {
        self.durations
            .lock()
            .entry(metric_key(name, tags))
            .or_default()
            .push(duration);
    }
}

fn format_tags(tags: Tags<'_>) -> String {
    tags.iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// `name{k=v,...}` with tags sorted, so tag order does not matter
fn metric_key(name: &str, tags: Tags<'_>) -> String {
    let mut sorted = tags.to_vec();
    sorted.sort_unstable();
    format!("{name}{{{}}}", format_tags(&sorted))
}
