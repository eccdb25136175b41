//! Per-filter metric registry and aggregation instruments
//!
//! Single writer (the supervisor thread observing ticks), single
//! background reader (the exporter taking snapshots). Both go through one
//! short-critical-section mutex; by convention it is always acquired
//! before any exporter-side state.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{auto_bounds, ExportMode, MetricKind, MetricSpec, MetricTarget};
use crate::{Error, Result};

/// Cap on buffered raw values per metric between exports
const RAW_BUFFER_CAP: usize = 1_000;

/// Bucketed distribution state.
///
/// `counts` always has one more slot than `bounds`: the trailing slot is
/// the open-ended upper bin.
#[derive(Debug, Clone)]
struct HistogramState {
    bounds: Vec<f64>,
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl HistogramState {
    fn new(bounds: Vec<f64>) -> Self {
        let counts = vec![0; bounds.len() + 1];
        HistogramState {
            bounds,
            counts,
            sum: 0.0,
            count: 0,
        }
    }

    fn record(&mut self, value: f64) {
        let idx = self.bounds.partition_point(|b| value > *b);
        self.counts[idx] += 1;
        self.sum += value;
        self.count += 1;
    }
}

struct Instrument {
    spec: MetricSpec,
    counter: f64,
    gauge: Option<f64>,
    histogram: Option<HistogramState>,
    raw: Vec<f64>,
    raw_dropped: u64,
}

impl Instrument {
    fn new(spec: MetricSpec) -> Self {
        let histogram = match spec.kind {
            MetricKind::Histogram => {
                let bounds = spec
                    .bounds
                    .clone()
                    .unwrap_or_else(|| auto_bounds(&spec.name, spec.bucket_count));
                Some(HistogramState::new(bounds))
            }
            _ => None,
        };
        Instrument {
            spec,
            counter: 0.0,
            gauge: None,
            histogram,
            raw: Vec::new(),
            raw_dropped: 0,
        }
    }

    fn record(&mut self, value: f64) {
        match self.spec.kind {
            MetricKind::Counter => self.counter += value,
            MetricKind::Gauge => self.gauge = Some(value),
            MetricKind::Histogram => {
                if let Some(h) = &mut self.histogram {
                    h.record(value);
                }
            }
        }
        if self.spec.export_mode.raw() {
            if self.raw.len() < RAW_BUFFER_CAP {
                self.raw.push(value);
            } else {
                self.raw_dropped += 1;
            }
        }
    }
}

/// Exported view of one histogram
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    /// Ascending bucket boundaries
    pub bounds: Vec<f64>,
    /// Per-bucket counts; `len == bounds.len() + 1`
    pub counts: Vec<u64>,
    /// Sum of recorded values
    pub sum: f64,
    /// Number of recorded values
    pub count: u64,
}

impl HistogramSnapshot {
    /// Arithmetic consistency: one extra open-ended bin, counts add up
    pub fn consistent(&self) -> bool {
        self.counts.len() == self.bounds.len() + 1
            && self.counts.iter().sum::<u64>() == self.count
    }
}

/// Exported view of one metric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    /// Metric name
    pub name: String,
    /// Aggregation semantics
    pub kind: MetricKind,
    /// Raw/aggregated selection
    pub export_mode: ExportMode,
    /// Telemetry/lineage destination
    pub target: MetricTarget,
    /// Counter running sum
    pub counter: f64,
    /// Latest gauge value
    pub gauge: Option<f64>,
    /// Histogram report
    pub histogram: Option<HistogramSnapshot>,
    /// Raw values recorded since the previous snapshot
    pub raw: Vec<f64>,
}

/// One snapshot of the whole registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Per-metric views, registration order
    pub metrics: Vec<MetricSnapshot>,
}

/// Registry of a filter's declared metrics and their instruments
pub struct MetricRegistry {
    inner: Mutex<Vec<Instrument>>,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricRegistry {
    /// Empty registry
    pub fn new() -> Self {
        MetricRegistry {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Register one spec. Duplicate names fail.
    pub fn register(&self, spec: MetricSpec) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.iter().any(|i| i.spec.name == spec.name) {
            return Err(Error::config_field(
                spec.name.clone(),
                "duplicate metric name",
            ));
        }
        inner.push(Instrument::new(spec));
        Ok(())
    }

    /// Register a batch of specs
    pub fn register_all(&self, specs: impl IntoIterator<Item = MetricSpec>) -> Result<()> {
        for spec in specs {
            self.register(spec)?;
        }
        Ok(())
    }

    /// Observe one topic's metadata bundle for a tick.
    ///
    /// Every spec's extractor runs; `None` results are skipped.
    pub fn observe(&self, meta: &Map<String, Value>) {
        let mut inner = self.inner.lock();
        for instrument in inner.iter_mut() {
            if let Some(value) = instrument.spec.value.extract(meta) {
                instrument.record(value);
            }
        }
    }

    /// Record a value directly by name (system sampler path).
    ///
    /// Unknown names are ignored.
    pub fn record(&self, name: &str, value: f64) {
        let mut inner = self.inner.lock();
        if let Some(instrument) = inner.iter_mut().find(|i| i.spec.name == name) {
            instrument.record(value);
        }
    }

    /// Number of registered metrics
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether no metrics are registered
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Snapshot every instrument, draining raw buffers.
    ///
    /// Counters and histograms stay cumulative across snapshots; raw
    /// values are handed over exactly once.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut inner = self.inner.lock();
        let metrics = inner
            .iter_mut()
            .map(|instrument| {
                if instrument.raw_dropped > 0 {
                    tracing::warn!(
                        metric = %instrument.spec.name,
                        dropped = instrument.raw_dropped,
                        "raw metric buffer overflowed between exports"
                    );
                    instrument.raw_dropped = 0;
                }
                MetricSnapshot {
                    name: instrument.spec.name.clone(),
                    kind: instrument.spec.kind,
                    export_mode: instrument.spec.export_mode,
                    target: instrument.spec.target,
                    counter: instrument.counter,
                    gauge: instrument.gauge,
                    histogram: instrument.histogram.as_ref().map(|h| HistogramSnapshot {
                        bounds: h.bounds.clone(),
                        counts: h.counts.clone(),
                        sum: h.sum,
                        count: h.count,
                    }),
                    raw: std::mem::take(&mut instrument.raw),
                }
            })
            .collect();
        MetricsSnapshot { metrics }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricValue;
    use serde_json::json;

    fn meta(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_counter_accumulates() {
        let reg = MetricRegistry::new();
        reg.register(MetricSpec::counter(
            "plates_seen",
            MetricValue::path("plates.length"),
        ))
        .unwrap();
        reg.observe(&meta(json!({ "plates": ["a", "b"] })));
        reg.observe(&meta(json!({ "plates": ["c"] })));
        reg.observe(&meta(json!({ "no_plates": 1 }))); // skipped
        let snap = reg.snapshot();
        assert_eq!(snap.metrics[0].counter, 3.0);
    }

    #[test]
    fn test_gauge_latest_wins() {
        let reg = MetricRegistry::new();
        reg.register(MetricSpec::gauge("queue", MetricValue::path("depth")))
            .unwrap();
        reg.observe(&meta(json!({ "depth": 4 })));
        reg.observe(&meta(json!({ "depth": 2 })));
        assert_eq!(reg.snapshot().metrics[0].gauge, Some(2.0));
    }

    #[test]
    fn test_histogram_invariants() {
        let reg = MetricRegistry::new();
        reg.register(
            MetricSpec::histogram("confidence", MetricValue::path("confidence"))
                .with_bucket_count(4),
        )
        .unwrap();
        for c in [0.05, 0.3, 0.55, 0.8, 0.99, 1.0] {
            reg.observe(&meta(json!({ "confidence": c })));
        }
        let snap = reg.snapshot();
        let hist = snap.metrics[0].histogram.as_ref().unwrap();
        assert!(hist.consistent());
        assert_eq!(hist.count, 6);
        assert_eq!(hist.counts.len(), hist.bounds.len() + 1);
        assert_eq!(hist.counts, vec![1, 1, 1, 3, 0]);
    }

    #[test]
    fn test_explicit_bounds_and_overflow_bin() {
        let reg = MetricRegistry::new();
        reg.register(
            MetricSpec::histogram("lat", MetricValue::path("lat"))
                .with_bounds(vec![1.0, 10.0, 100.0]),
        )
        .unwrap();
        for v in [0.5, 5.0, 50.0, 500.0] {
            reg.observe(&meta(json!({ "lat": v })));
        }
        let snap = reg.snapshot();
        let hist = snap.metrics[0].histogram.as_ref().unwrap();
        assert_eq!(hist.counts, vec![1, 1, 1, 1]);
        assert!(hist.consistent());
    }

    #[test]
    fn test_raw_drained_once() {
        let reg = MetricRegistry::new();
        reg.register(
            MetricSpec::counter("n", MetricValue::path("n"))
                .with_export_mode(ExportMode::Both),
        )
        .unwrap();
        reg.observe(&meta(json!({ "n": 1 })));
        reg.observe(&meta(json!({ "n": 2 })));
        assert_eq!(reg.snapshot().metrics[0].raw, vec![1.0, 2.0]);
        // drained: second snapshot sees no raw values but keeps the sum
        let again = reg.snapshot();
        assert!(again.metrics[0].raw.is_empty());
        assert_eq!(again.metrics[0].counter, 3.0);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let reg = MetricRegistry::new();
        reg.register(MetricSpec::gauge("x", MetricValue::path("x")))
            .unwrap();
        assert!(reg
            .register(MetricSpec::counter("x", MetricValue::path("x")))
            .is_err());
    }
}
