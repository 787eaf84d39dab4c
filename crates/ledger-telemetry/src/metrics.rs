use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// One series' value at the time of [`MetricsRecorder::snapshot`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub name: String,
    pub value: f64,
    pub labels: Vec<(String, String)>,
    pub metric_type: MetricType,
}

/// Summary of a histogram's observations. `count`, `sum`, `min` and `max`
/// cover every observation; percentiles cover the most recent
/// [`HISTOGRAM_WINDOW`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Default)]
struct Counter(AtomicU64);

/// f64 stored as raw bits.
#[derive(Default)]
struct Gauge(AtomicU64);

impl Gauge {
    fn add(&self, delta: f64) {
        let _ = self.0.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
            Some((f64::from_bits(bits) + delta).to_bits())
        });
    }

    fn value(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Observations kept per histogram for percentiles.
pub const HISTOGRAM_WINDOW: usize = 1024;

#[derive(Default)]
struct HistogramState {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    recent: VecDeque<f64>,
}

#[derive(Default)]
struct Histogram(Mutex<HistogramState>);

impl Histogram {
    fn observe(&self, value: f64) {
        let mut state = self.0.lock();
        if state.count == 0 {
            state.min = value;
            state.max = value;
        } else {
            state.min = state.min.min(value);
            state.max = state.max.max(value);
        }
        state.count += 1;
        state.sum += value;
        if state.recent.len() == HISTOGRAM_WINDOW {
            state.recent.pop_front();
        }
        state.recent.push_back(value);
    }

    fn summary(&self) -> HistogramSummary {
        let state = self.0.lock();
        if state.count == 0 {
            return HistogramSummary::default();
        }
        let mut window: Vec<f64> = state.recent.iter().copied().collect();
        window.sort_by(f64::total_cmp);
        let rank = |q: f64| window[((window.len() as f64 * q) as usize).min(window.len() - 1)];
        HistogramSummary {
            count: state.count,
            sum: state.sum,
            min: state.min,
            max: state.max,
            p50: rank(0.50),
            p95: rank(0.95),
            p99: rank(0.99),
        }
    }
}

/// Metric name plus labels sorted by key, so label order at the call site
/// does not create a separate series.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct SeriesKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        labels.sort();
        Self {
            name: name.to_owned(),
            labels,
        }
    }
}

/// Series of one metric kind, created on first use.
struct Family<M>(RwLock<HashMap<SeriesKey, M>>);

impl<M: Default> Default for Family<M> {
    fn default() -> Self {
        Self(RwLock::new(HashMap::new()))
    }
}

impl<M: Default> Family<M> {
    fn with(&self, name: &str, labels: &[(&str, &str)], f: impl FnOnce(&M)) {
        let key = SeriesKey::new(name, labels);
        if let Some(series) = self.0.read().get(&key) {
            f(series);
            return;
        }
        f(self.0.write().entry(key).or_default());
    }

    fn read<T>(&self, name: &str, labels: &[(&str, &str)], f: impl FnOnce(&M) -> T) -> Option<T> {
        self.0.read().get(&SeriesKey::new(name, labels)).map(f)
    }

    fn collect(&self, kind: MetricType, timestamp: &str, value: impl Fn(&M) -> f64) -> Vec<MetricsSnapshot> {
        self.0
            .read()
            .iter()
            .map(|(key, series)| MetricsSnapshot {
                timestamp: timestamp.to_owned(),
                name: key.name.clone(),
                value: value(series),
                labels: key.labels.clone(),
                metric_type: kind.clone(),
            })
            .collect()
    }
}

/// Thread-safe in-memory metrics. Shared between the store and every
/// session it hands out.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: Family<Counter>,
    gauges: Family<Gauge>,
    histograms: Family<Histogram>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.counters.with(name, labels, |c| {
            c.0.fetch_add(n, Ordering::Relaxed);
        });
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read(name, labels, |c| c.0.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.gauges
            .with(name, labels, |g| g.0.store(value.to_bits(), Ordering::Relaxed));
    }

    /// Add `delta` (possibly negative) to a gauge.
    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        self.gauges.with(name, labels, |g| g.add(delta));
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.gauges.read(name, labels, Gauge::value).unwrap_or(0.0)
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.histograms.with(name, labels, |h| h.observe(value));
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .read(name, labels, Histogram::summary)
            .unwrap_or_default()
    }

    /// Current value of every series, sorted by name then labels.
    /// Histograms report their p50.
    pub fn snapshot(&self) -> Vec<MetricsSnapshot> {
        let now = Utc::now().to_rfc3339();
        let mut out = self.counters.collect(MetricType::Counter, &now, |c| {
            c.0.load(Ordering::Relaxed) as f64
        });
        out.extend(self.gauges.collect(MetricType::Gauge, &now, Gauge::value));
        out.extend(
            self.histograms
                .collect(MetricType::Histogram, &now, |h| h.summary().p50),
        );
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_per_label_set() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("ledger_transfers_total", &[("outcome", "ok")], 1);
        recorder.counter_inc("ledger_transfers_total", &[("outcome", "ok")], 2);
        assert_eq!(recorder.counter_get("ledger_transfers_total", &[("outcome", "ok")]), 3);
        assert_eq!(
            recorder.counter_get("ledger_transfers_total", &[("outcome", "insufficient_funds")]),
            0
        );
    }

    #[test]
    fn label_order_does_not_matter() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("m", &[("a", "1"), ("b", "2")], 1);
        recorder.counter_inc("m", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(recorder.counter_get("m", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn gauge_up_and_down() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_inc("ledger_sessions_active", &[], 1.0);
        recorder.gauge_inc("ledger_sessions_active", &[], 1.0);
        recorder.gauge_inc("ledger_sessions_active", &[], -1.0);
        assert_eq!(recorder.gauge_get("ledger_sessions_active", &[]), 1.0);
        recorder.gauge_set("ledger_sessions_active", &[], 7.5);
        assert_eq!(recorder.gauge_get("ledger_sessions_active", &[]), 7.5);
        recorder.gauge_inc("ledger_sessions_active", &[], -10.0);
        assert_eq!(recorder.gauge_get("ledger_sessions_active", &[]), -2.5);
    }

    #[test]
    fn histogram_summary() {
        let recorder = MetricsRecorder::new();
        for i in (1..=100).rev() {
            recorder.histogram_observe("ledger_session_duration_ms", &[], f64::from(i));
        }
        let summary = recorder.histogram_summary("ledger_session_duration_ms", &[]);
        assert_eq!(summary.count, 100);
        assert_eq!(summary.sum, 5050.0);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 100.0);
        assert_eq!(summary.p50, 51.0);
        assert_eq!(summary.p99, 100.0);
    }

    #[test]
    fn histogram_memory_is_bounded() {
        let recorder = MetricsRecorder::new();
        let total = HISTOGRAM_WINDOW * 3;
        for i in 0..total {
            recorder.histogram_observe("ledger_session_duration_ms", &[], i as f64);
        }
        let summary = recorder.histogram_summary("ledger_session_duration_ms", &[]);
        assert_eq!(summary.count, total as u64);
        assert_eq!(summary.min, 0.0);
        assert_eq!(summary.max, (total - 1) as f64);
        // Percentiles come from the last window only.
        assert!(summary.p50 >= (total - HISTOGRAM_WINDOW) as f64);

        let histograms = recorder.histograms.0.read();
        let series = histograms.values().next().unwrap();
        assert_eq!(series.0.lock().recent.len(), HISTOGRAM_WINDOW);
    }

    #[test]
    fn missing_series_read_as_zero() {
        let recorder = MetricsRecorder::new();
        assert_eq!(recorder.counter_get("missing", &[]), 0);
        assert_eq!(recorder.gauge_get("missing", &[]), 0.0);
        assert_eq!(recorder.histogram_summary("missing", &[]).count, 0);
    }

    #[test]
    fn snapshot_lists_every_series() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("b_counter", &[], 4);
        recorder.gauge_set("a_gauge", &[], 2.0);
        recorder.histogram_observe("c_hist", &[], 9.0);

        let snap = recorder.snapshot();
        let names: Vec<&str> = snap.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a_gauge", "b_counter", "c_hist"]);
        assert_eq!(snap[1].value, 4.0);
        assert_eq!(snap[1].metric_type, MetricType::Counter);
        assert_eq!(snap[2].value, 9.0);
    }

    #[test]
    fn concurrent_increments() {
        let recorder = std::sync::Arc::new(MetricsRecorder::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = recorder.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        r.counter_inc("hits", &[], 1);
                        r.gauge_inc("level", &[], 0.5);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(recorder.counter_get("hits", &[]), 8000);
        assert_eq!(recorder.gauge_get("level", &[]), 4000.0);
    }
}
