//! Declarative metric specifications
//!
//! Filters describe what to measure as a plain list of [`MetricSpec`]
//! values returned from their `metric_specs` hook. The supervisor feeds
//! every tick's metadata through the registry; a background exporter
//! periodically drains aggregated snapshots, gated by the process-wide
//! allowlist.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::frame::lookup_path;

mod allowlist;
mod registry;

pub use allowlist::MetricAllowlist;
pub use registry::{HistogramSnapshot, MetricRegistry, MetricSnapshot, MetricsSnapshot};

/// Aggregation semantics of a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Monotonic accumulator
    Counter,
    /// Bucketed distribution
    Histogram,
    /// Latest value wins
    Gauge,
}

/// What the exporter sends for a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    /// Each recorded value as-is
    Raw,
    /// Counter sums and histogram bucket reports
    #[default]
    Aggregated,
    /// Both raw values and aggregates
    Both,
}

impl ExportMode {
    /// Whether raw values are exported
    pub fn raw(&self) -> bool {
        matches!(self, ExportMode::Raw | ExportMode::Both)
    }

    /// Whether aggregates are exported
    pub fn aggregated(&self) -> bool {
        matches!(self, ExportMode::Aggregated | ExportMode::Both)
    }
}

/// Destination of a metric's exports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricTarget {
    /// Telemetry exporter only
    Otel,
    /// Lineage facets only
    Lineage,
    /// Both destinations
    #[default]
    Both,
}

impl MetricTarget {
    /// Whether the telemetry exporter sees this metric
    pub fn otel(&self) -> bool {
        matches!(self, MetricTarget::Otel | MetricTarget::Both)
    }

    /// Whether lineage facets see this metric
    pub fn lineage(&self) -> bool {
        matches!(self, MetricTarget::Lineage | MetricTarget::Both)
    }
}

/// How a metric's value is pulled out of tick metadata.
///
/// Either a declarative dot path over the metadata document (portable,
/// serializable) or a first-class function. A `None` result means "do not
/// record this tick"; invalid metadata never raises.
#[derive(Clone)]
pub enum MetricValue {
    /// Dot path, e.g. `plates.length` or `detection.confidence`
    Path(String),
    /// Arbitrary extractor
    Func(Arc<dyn Fn(&Map<String, Value>) -> Option<f64> + Send + Sync>),
}

impl MetricValue {
    /// Declarative path extractor
    pub fn path(path: impl Into<String>) -> Self {
        MetricValue::Path(path.into())
    }

    /// Function extractor
    pub fn func(f: impl Fn(&Map<String, Value>) -> Option<f64> + Send + Sync + 'static) -> Self {
        MetricValue::Func(Arc::new(f))
    }

    /// Extract a number from one topic's metadata, `None` to skip
    pub fn extract(&self, meta: &Map<String, Value>) -> Option<f64> {
        match self {
            MetricValue::Path(path) => number_of(&lookup_path(meta, path)?),
            MetricValue::Func(f) => f(meta),
        }
    }
}

impl fmt::Debug for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Path(p) => f.debug_tuple("Path").field(p).finish(),
            MetricValue::Func(_) => f.write_str("Func(..)"),
        }
    }
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Declarative description of one metric to collect
#[derive(Debug, Clone)]
pub struct MetricSpec {
    /// Export name; must pass the allowlist to leave the process
    pub name: String,
    /// Aggregation semantics
    pub kind: MetricKind,
    /// Value extractor
    pub value: MetricValue,
    /// Explicit histogram bucket boundaries
    pub bounds: Option<Vec<f64>>,
    /// Boundary count for auto-generated buckets
    pub bucket_count: Option<usize>,
    /// Raw/aggregated export selection
    pub export_mode: ExportMode,
    /// Telemetry/lineage destination selection
    pub target: MetricTarget,
}

impl MetricSpec {
    fn new(name: impl Into<String>, kind: MetricKind, value: MetricValue) -> Self {
        MetricSpec {
            name: name.into(),
            kind,
            value,
            bounds: None,
            bucket_count: None,
            export_mode: ExportMode::default(),
            target: MetricTarget::default(),
        }
    }

    /// Monotonic counter
    pub fn counter(name: impl Into<String>, value: MetricValue) -> Self {
        Self::new(name, MetricKind::Counter, value)
    }

    /// Bucketed histogram
    pub fn histogram(name: impl Into<String>, value: MetricValue) -> Self {
        Self::new(name, MetricKind::Histogram, value)
    }

    /// Latest-value gauge
    pub fn gauge(name: impl Into<String>, value: MetricValue) -> Self {
        Self::new(name, MetricKind::Gauge, value)
    }

    /// Explicit histogram bucket boundaries (ascending)
    pub fn with_bounds(mut self, bounds: Vec<f64>) -> Self {
        self.bounds = Some(bounds);
        self
    }

    /// Boundary count for auto-generated buckets
    pub fn with_bucket_count(mut self, count: usize) -> Self {
        self.bucket_count = Some(count);
        self
    }

    /// Raw/aggregated export selection
    pub fn with_export_mode(mut self, mode: ExportMode) -> Self {
        self.export_mode = mode;
        self
    }

    /// Telemetry/lineage destination selection
    pub fn with_target(mut self, target: MetricTarget) -> Self {
        self.target = target;
        self
    }
}

/// Default boundary count when a histogram declares none
pub const DEFAULT_BUCKET_COUNT: usize = 16;

/// Generate bucket boundaries for a histogram spec.
///
/// Semantic defaults key off the metric name: anything mentioning
/// `confidence` gets linear [0, 1] boundaries. Everything else gets
/// logarithmic boundaries spanning 0.01 .. 10000, which covers latencies
/// in milliseconds as well as small counts.
pub fn auto_bounds(name: &str, bucket_count: Option<usize>) -> Vec<f64> {
    let n = bucket_count.unwrap_or(DEFAULT_BUCKET_COUNT).max(1);
    if name.to_ascii_lowercase().contains("confidence") {
        return (1..=n).map(|i| i as f64 / n as f64).collect();
    }
    log_bounds(0.01, 10_000.0, n)
}

/// Logarithmic boundaries from `min` to `max`, inclusive at both ends
pub fn log_bounds(min: f64, max: f64, count: usize) -> Vec<f64> {
    let n = count.max(1);
    if n == 1 {
        return vec![max];
    }
    let ratio = (max / min).ln();
    (0..n)
        .map(|i| min * (ratio * i as f64 / (n - 1) as f64).exp())
        .collect()
}
