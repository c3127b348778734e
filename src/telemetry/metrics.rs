//! Append-only labeled metric samples (§4.10). Four instrument kinds;
//! a fixed-capacity ring per name keeps memory bounded without a full
//! time-series backend — this is an in-process collector, not a
//! Prometheus exporter.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

#[derive(Debug, Clone)]
pub struct MetricSample {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    pub labels: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

const MAX_SAMPLES_PER_NAME: usize = 1000;

pub struct MetricCollector {
    samples: Mutex<HashMap<String, Vec<MetricSample>>>,
}

impl MetricCollector {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(
        &self,
        name: impl Into<String>,
        kind: MetricKind,
        value: f64,
        labels: HashMap<String, String>,
    ) {
        let name = name.into();
        let sample = MetricSample {
            name: name.clone(),
            kind,
            value,
            labels,
            timestamp: Utc::now(),
        };
        let mut samples = self.samples.lock();
        let series = samples.entry(name).or_default();
        series.push(sample);
        if series.len() > MAX_SAMPLES_PER_NAME {
            series.remove(0);
        }
    }

    pub fn record_batch(&self, batch: Vec<(String, MetricKind, f64, HashMap<String, String>)>) {
        for (name, kind, value, labels) in batch {
            self.record(name, kind, value, labels);
        }
    }

    pub fn counter(&self, name: impl Into<String>, value: f64) {
        self.record(name, MetricKind::Counter, value, HashMap::new());
    }

    pub fn gauge(&self, name: impl Into<String>, value: f64) {
        self.record(name, MetricKind::Gauge, value, HashMap::new());
    }

    pub fn series(&self, name: &str) -> Vec<MetricSample> {
        self.samples.lock().get(name).cloned().unwrap_or_default()
    }

    pub fn names(&self) -> Vec<String> {
        self.samples.lock().keys().cloned().collect()
    }
}

impl Default for MetricCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_reads_back_a_series() {
        let mc = MetricCollector::new();
        mc.counter("ticks_received", 1.0);
        mc.counter("ticks_received", 1.0);
        assert_eq!(mc.series("ticks_received").len(), 2);
    }

    #[test]
    fn series_caps_at_max_samples() {
        let mc = MetricCollector::new();
        for _ in 0..(MAX_SAMPLES_PER_NAME + 10) {
            mc.gauge("queue_depth", 5.0);
        }
        assert_eq!(mc.series("queue_depth").len(), MAX_SAMPLES_PER_NAME);
    }

    #[test]
    fn batch_ingest_records_every_entry() {
        let mc = MetricCollector::new();
        mc.record_batch(vec![
            ("a".to_string(), MetricKind::Counter, 1.0, HashMap::new()),
            ("b".to_string(), MetricKind::Gauge, 2.0, HashMap::new()),
        ]);
        assert_eq!(mc.series("a").len(), 1);
        assert_eq!(mc.series("b").len(), 1);
    }
}
