use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// In-memory counter. Monotonically increasing.
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// In-memory gauge. Can go up or down.
struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }
    fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }
    fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }
    fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// In-memory histogram. Stores observations for percentile computation.
struct Histogram {
    observations: Mutex<Vec<f64>>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            observations: Mutex::new(Vec::new()),
        }
    }
    fn observe(&self, value: f64) {
        self.observations.lock().push(value);
    }
    fn summary(&self) -> HistogramSummary {
        let mut obs = self.observations.lock();
        if obs.is_empty() {
            return HistogramSummary::default();
        }
        obs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = obs.len();
        let sum: f64 = obs.iter().sum();
        HistogramSummary {
            count: count as u64,
            sum,
            p50: obs[count / 2],
            p95: obs[((count as f64 * 0.95) as usize).min(count - 1)],
            p99: obs[((count as f64 * 0.99) as usize).min(count - 1)],
        }
    }
}

/// Summary statistics from a histogram.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Point-in-time view of all recorded metrics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, i64>,
    pub histograms: HashMap<String, HistogramSummary>,
}

/// Registry of named counters, gauges, and histograms, shared across the
/// orchestrator. Cheap to record; snapshotted on demand for /metrics.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<String, Counter>>,
    gauges: RwLock<HashMap<String, Gauge>>,
    histograms: RwLock<HashMap<String, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, n: u64) {
        if let Some(c) = self.counters.read().get(name) {
            c.increment(n);
            return;
        }
        let mut counters = self.counters.write();
        counters.entry(name.to_string()).or_insert_with(Counter::new).increment(n);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.read().get(name).map(Counter::get).unwrap_or(0)
    }

    pub fn set_gauge(&self, name: &str, value: i64) {
        if let Some(g) = self.gauges.read().get(name) {
            g.set(value);
            return;
        }
        let mut gauges = self.gauges.write();
        gauges.entry(name.to_string()).or_insert_with(Gauge::new).set(value);
    }

    pub fn add_gauge(&self, name: &str, delta: i64) {
        if let Some(g) = self.gauges.read().get(name) {
            g.add(delta);
            return;
        }
        let mut gauges = self.gauges.write();
        gauges.entry(name.to_string()).or_insert_with(Gauge::new).add(delta);
    }

    pub fn gauge(&self, name: &str) -> i64 {
        self.gauges.read().get(name).map(Gauge::get).unwrap_or(0)
    }

    pub fn observe(&self, name: &str, value: f64) {
        if let Some(h) = self.histograms.read().get(name) {
            h.observe(value);
            return;
        }
        let mut histograms = self.histograms.write();
        histograms.entry(name.to_string()).or_insert_with(Histogram::new).observe(value);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            counters: self
                .counters
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.get()))
                .collect(),
            gauges: self
                .gauges
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.get()))
                .collect(),
            histograms: self
                .histograms
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.summary()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments() {
        let recorder = MetricsRecorder::new();
        recorder.increment_counter("tools_executed", 1);
        recorder.increment_counter("tools_executed", 2);
        assert_eq!(recorder.counter("tools_executed"), 3);
        assert_eq!(recorder.counter("missing"), 0);
    }

    #[test]
    fn gauge_set_and_add() {
        let recorder = MetricsRecorder::new();
        recorder.set_gauge("sessions_connected", 5);
        recorder.add_gauge("sessions_connected", -2);
        assert_eq!(recorder.gauge("sessions_connected"), 3);
    }

    #[test]
    fn histogram_percentiles() {
        let recorder = MetricsRecorder::new();
        for i in 1..=100 {
            recorder.observe("tool_duration_ms", i as f64);
        }
        let snap = recorder.snapshot();
        let summary = &snap.histograms["tool_duration_ms"];
        assert_eq!(summary.count, 100);
        assert!(summary.p50 >= 50.0 && summary.p50 <= 52.0);
        assert!(summary.p95 >= 95.0);
    }

    #[test]
    fn snapshot_includes_all_kinds() {
        let recorder = MetricsRecorder::new();
        recorder.increment_counter("rate_limit_denials", 1);
        recorder.set_gauge("queued_messages", 7);
        recorder.observe("workflow_duration_ms", 12.5);

        let snap = recorder.snapshot();
        assert_eq!(snap.counters["rate_limit_denials"], 1);
        assert_eq!(snap.gauges["queued_messages"], 7);
        assert_eq!(snap.histograms["workflow_duration_ms"].count, 1);
        assert!(!snap.timestamp.is_empty());
    }

    #[test]
    fn concurrent_counter_updates() {
        use std::sync::Arc;
        let recorder = Arc::new(MetricsRecorder::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&recorder);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        r.increment_counter("events_published", 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(recorder.counter("events_published"), 8000);
    }
}
