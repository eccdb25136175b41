//! Telemetry export
//!
//! A background driver snapshots the filter's metric registry on a fixed
//! interval, gates every metric through the process-wide allowlist and
//! hands the surviving batch to the configured exporter. Export failures
//! retry with backoff and are never allowed to block the supervisor; the
//! shutdown flush is bounded at two seconds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prometheus::Encoder;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use openfilter_core::metrics::{MetricAllowlist, MetricKind, MetricRegistry, MetricSnapshot};
use openfilter_core::{Error, Result};
use openfilter_transport::Backoff;

pub mod lineage;

/// `TELEMETRY_ENABLED` — enable aggregation and export
pub const ENV_TELEMETRY_ENABLED: &str = "TELEMETRY_ENABLED";
/// `TELEMETRY_EXPORTER` — exporter selection
pub const ENV_TELEMETRY_EXPORTER: &str = "TELEMETRY_EXPORTER";
/// `TELEMETRY_ENDPOINT` — exporter target (URL or bind address)
pub const ENV_TELEMETRY_ENDPOINT: &str = "TELEMETRY_ENDPOINT";
/// `EXPORT_INTERVAL_MS` — aggregation→export interval
pub const ENV_EXPORT_INTERVAL_MS: &str = "EXPORT_INTERVAL_MS";

/// Shutdown flush budget; never extends total shutdown beyond grace
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Which exporter carries metrics out of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterKind {
    /// Structured log lines
    Console,
    /// Prometheus scrape endpoint
    Prometheus,
    /// JSON batches POSTed over HTTP
    OtlpHttp,
}

impl ExporterKind {
    /// Parse a `TELEMETRY_EXPORTER` value.
    ///
    /// `otlp_grpc` and `gcm` are recognized names without an
    /// implementation behind them; they fail loudly rather than silently
    /// exporting nothing.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "console" => Ok(ExporterKind::Console),
            "prometheus" => Ok(ExporterKind::Prometheus),
            "otlp_http" => Ok(ExporterKind::OtlpHttp),
            "otlp_grpc" | "gcm" => Err(Error::config(
                "unsupported-exporter",
                format!("exporter {s:?} is not built into this runtime"),
            )),
            other => Err(Error::config(
                "unknown-exporter",
                format!("unknown exporter {other:?}"),
            )),
        }
    }
}

/// Resolved telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Whether the export driver runs at all
    pub enabled: bool,
    /// Exporter selection
    pub exporter: ExporterKind,
    /// Exporter target
    pub endpoint: Option<String>,
    /// Export interval
    pub interval: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            enabled: false,
            exporter: ExporterKind::Console,
            endpoint: None,
            interval: Duration::from_secs(10),
        }
    }
}

impl TelemetryConfig {
    /// Resolve from the environment
    pub fn from_env() -> Result<Self> {
        let mut cfg = TelemetryConfig::default();
        if let Ok(raw) = std::env::var(ENV_TELEMETRY_ENABLED) {
            cfg.enabled = openfilter_core::config::coerce_bool(&raw)?;
        }
        if let Ok(raw) = std::env::var(ENV_TELEMETRY_EXPORTER) {
            cfg.exporter = ExporterKind::parse(&raw)?;
        }
        if let Ok(raw) = std::env::var(ENV_TELEMETRY_ENDPOINT) {
            if !raw.trim().is_empty() {
                cfg.endpoint = Some(raw.trim().to_string());
            }
        }
        if let Ok(raw) = std::env::var(ENV_EXPORT_INTERVAL_MS) {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                Error::config_field(ENV_EXPORT_INTERVAL_MS, format!("not a number: {raw:?}"))
            })?;
            cfg.interval = Duration::from_millis(ms.max(100));
        }
        Ok(cfg)
    }
}

/// One allowlist-filtered export payload
#[derive(Debug, Clone, Serialize)]
pub struct ExportBatch {
    /// Producing filter
    pub filter_id: String,
    /// Correlating run
    pub run_id: String,
    /// Batch wall time, milliseconds
    pub ts_ms: u64,
    /// Surviving metrics
    pub metrics: Vec<MetricSnapshot>,
}

/// Destination for metric batches
#[async_trait]
pub trait MetricExporter: Send {
    /// Deliver one batch
    async fn export(&mut self, batch: &ExportBatch) -> Result<()>;
}

/// Build the configured exporter
pub fn build_exporter(cfg: &TelemetryConfig) -> Result<Box<dyn MetricExporter>> {
    match cfg.exporter {
        ExporterKind::Console => Ok(Box::new(ConsoleExporter)),
        ExporterKind::OtlpHttp => {
            let endpoint = cfg.endpoint.clone().ok_or_else(|| {
                Error::config_field(ENV_TELEMETRY_ENDPOINT, "otlp_http requires an endpoint URL")
            })?;
            Ok(Box::new(OtlpHttpExporter::new(endpoint)))
        }
        ExporterKind::Prometheus => {
            let bind = cfg
                .endpoint
                .clone()
                .unwrap_or_else(|| "127.0.0.1:9464".to_string());
            Ok(Box::new(PrometheusExporter::new(bind)))
        }
    }
}

/// Logs each batch as one structured line
struct ConsoleExporter;

#[async_trait]
impl MetricExporter for ConsoleExporter {
    async fn export(&mut self, batch: &ExportBatch) -> Result<()> {
        let payload = serde_json::to_string(batch)?;
        tracing::info!(target: "openfilter::telemetry", %payload, "metrics export");
        Ok(())
    }
}

/// POSTs JSON batches to a collector
struct OtlpHttpExporter {
    client: reqwest::Client,
    endpoint: String,
}

impl OtlpHttpExporter {
    fn new(endpoint: String) -> Self {
        OtlpHttpExporter {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl MetricExporter for OtlpHttpExporter {
    async fn export(&mut self, batch: &ExportBatch) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(batch)
            .send()
            .await
            .map_err(|e| Error::telemetry("export-failed", e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::telemetry(
                "export-failed",
                format!("{}: HTTP {}", self.endpoint, response.status()),
            ));
        }
        Ok(())
    }
}

/// Feeds a scrape registry served on a local HTTP endpoint.
///
/// Counters and gauges map to their native instrument types; histogram
/// reports are exposed as per-bucket gauges labelled `le` plus `_sum`
/// and `_count` gauges.
struct PrometheusExporter {
    registry: prometheus::Registry,
    counters: HashMap<String, (prometheus::Counter, f64)>,
    gauges: HashMap<String, prometheus::Gauge>,
    buckets: HashMap<String, prometheus::GaugeVec>,
    server: Option<JoinHandle<()>>,
    bind: String,
}

impl PrometheusExporter {
    fn new(bind: String) -> Self {
        PrometheusExporter {
            registry: prometheus::Registry::new(),
            counters: HashMap::new(),
            gauges: HashMap::new(),
            buckets: HashMap::new(),
            server: None,
            bind,
        }
    }

    fn ensure_server(&mut self) {
        if self.server.is_some() {
            return;
        }
        let registry = self.registry.clone();
        let bind = self.bind.clone();
        self.server = Some(tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&bind).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::warn!(%bind, error = %e, "prometheus endpoint bind failed");
                    return;
                }
            };
            tracing::info!(%bind, "prometheus scrape endpoint up");
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    continue;
                };
                let registry = registry.clone();
                tokio::spawn(async move {
                    let io = hyper_util::rt::TokioIo::new(stream);
                    let service = hyper::service::service_fn(move |_req| {
                        let registry = registry.clone();
                        async move {
                            let mut buf = Vec::new();
                            let encoder = prometheus::TextEncoder::new();
                            if let Err(e) = encoder.encode(&registry.gather(), &mut buf) {
                                tracing::warn!(error = %e, "prometheus encode failed");
                            }
                            Ok::<_, std::convert::Infallible>(hyper::Response::new(
                                http_body_util::Full::new(bytes::Bytes::from(buf)),
                            ))
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await;
                });
            }
        }));
    }

    fn apply(&mut self, metric: &MetricSnapshot) -> Result<()> {
        let map_err = |e: prometheus::Error| Error::telemetry("export-failed", e.to_string());
        match metric.kind {
            MetricKind::Counter => {
                if !self.counters.contains_key(&metric.name) {
                    let counter =
                        prometheus::Counter::new(metric.name.clone(), metric.name.clone())
                            .map_err(map_err)?;
                    self.registry.register(Box::new(counter.clone())).map_err(map_err)?;
                    self.counters.insert(metric.name.clone(), (counter, 0.0));
                }
                let (counter, last) = self.counters.get_mut(&metric.name).expect("just inserted");
                let delta = metric.counter - *last;
                if delta > 0.0 {
                    counter.inc_by(delta);
                    *last = metric.counter;
                }
            }
            MetricKind::Gauge => {
                if !self.gauges.contains_key(&metric.name) {
                    let gauge = prometheus::Gauge::new(metric.name.clone(), metric.name.clone())
                        .map_err(map_err)?;
                    self.registry.register(Box::new(gauge.clone())).map_err(map_err)?;
                    self.gauges.insert(metric.name.clone(), gauge);
                }
                if let Some(value) = metric.gauge {
                    self.gauges[&metric.name].set(value);
                }
            }
            MetricKind::Histogram => {
                let Some(hist) = &metric.histogram else {
                    return Ok(());
                };
                if !self.buckets.contains_key(&metric.name) {
                    let vec = prometheus::GaugeVec::new(
                        prometheus::Opts::new(
                            format!("{}_bucket", metric.name),
                            metric.name.clone(),
                        ),
                        &["le"],
                    )
                    .map_err(map_err)?;
                    self.registry.register(Box::new(vec.clone())).map_err(map_err)?;
                    self.buckets.insert(metric.name.clone(), vec);
                    let sum = prometheus::Gauge::new(
                        format!("{}_sum", metric.name),
                        metric.name.clone(),
                    )
                    .map_err(map_err)?;
                    self.registry.register(Box::new(sum.clone())).map_err(map_err)?;
                    self.gauges.insert(format!("{}_sum", metric.name), sum);
                    let count = prometheus::Gauge::new(
                        format!("{}_count", metric.name),
                        metric.name.clone(),
                    )
                    .map_err(map_err)?;
                    self.registry.register(Box::new(count.clone())).map_err(map_err)?;
                    self.gauges.insert(format!("{}_count", metric.name), count);
                }
                let vec = &self.buckets[&metric.name];
                let mut cumulative = 0u64;
                for (i, count) in hist.counts.iter().enumerate() {
                    cumulative += count;
                    let label = hist
                        .bounds
                        .get(i)
                        .map(|b| b.to_string())
                        .unwrap_or_else(|| "+Inf".to_string());
                    vec.with_label_values(&[label.as_str()]).set(cumulative as f64);
                }
                self.gauges[&format!("{}_sum", metric.name)].set(hist.sum);
                self.gauges[&format!("{}_count", metric.name)].set(hist.count as f64);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MetricExporter for PrometheusExporter {
    async fn export(&mut self, batch: &ExportBatch) -> Result<()> {
        self.ensure_server();
        for metric in &batch.metrics {
            self.apply(metric)?;
        }
        Ok(())
    }
}

/// Handle on the background export driver
pub struct TelemetryHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TelemetryHandle {
    /// Flush once and stop, bounded by [`FLUSH_TIMEOUT`]
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(FLUSH_TIMEOUT, self.task).await.is_err() {
            tracing::warn!("telemetry flush timed out");
        }
    }
}

/// Start the export driver for one filter
pub fn spawn_exporter(
    registry: Arc<MetricRegistry>,
    allowlist: Arc<MetricAllowlist>,
    mut exporter: Box<dyn MetricExporter>,
    interval: Duration,
    filter_id: String,
    run_id: String,
) -> TelemetryHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick carries nothing yet
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    export_once(&registry, &allowlist, exporter.as_mut(), &filter_id, &run_id)
                        .await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        export_once(&registry, &allowlist, exporter.as_mut(), &filter_id, &run_id)
                            .await;
                        return;
                    }
                }
            }
        }
    });
    TelemetryHandle { shutdown, task }
}

async fn export_once(
    registry: &MetricRegistry,
    allowlist: &MetricAllowlist,
    exporter: &mut dyn MetricExporter,
    filter_id: &str,
    run_id: &str,
) {
    let snapshot = registry.snapshot();
    let metrics: Vec<MetricSnapshot> = snapshot
        .metrics
        .into_iter()
        .filter(|m| m.target.otel())
        .filter(|m| allowlist.check(&m.name))
        .map(|mut m| {
            if !m.export_mode.raw() {
                m.raw.clear();
            }
            if !m.export_mode.aggregated() {
                m.counter = 0.0;
                m.gauge = None;
                m.histogram = None;
            }
            m
        })
        .collect();
    if metrics.is_empty() {
        return;
    }
    let batch = ExportBatch {
        filter_id: filter_id.to_string(),
        run_id: run_id.to_string(),
        ts_ms: openfilter_transport::wire::now_ms(),
        metrics,
    };

    let mut backoff = Backoff::new();
    for attempt in 0..3 {
        match exporter.export(&batch).await {
            Ok(()) => return,
            Err(e) => {
                tracing::warn!(error = %e, attempt, "metrics export failed");
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openfilter_core::metrics::{MetricSpec, MetricValue};
    use parking_lot::Mutex;

    /// Captures batches for assertions
    pub(crate) struct CaptureExporter {
        pub batches: Arc<Mutex<Vec<ExportBatch>>>,
    }

    #[async_trait]
    impl MetricExporter for CaptureExporter {
        async fn export(&mut self, batch: &ExportBatch) -> Result<()> {
            self.batches.lock().push(batch.clone());
            Ok(())
        }
    }

    #[test]
    fn test_exporter_kind_parse() {
        assert_eq!(ExporterKind::parse("CONSOLE").unwrap(), ExporterKind::Console);
        assert_eq!(
            ExporterKind::parse("otlp_http").unwrap(),
            ExporterKind::OtlpHttp
        );
        assert_eq!(
            ExporterKind::parse("otlp_grpc").unwrap_err().kind(),
            Some("unsupported-exporter")
        );
        assert_eq!(
            ExporterKind::parse("statsd").unwrap_err().kind(),
            Some("unknown-exporter")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_allowlist_gates_export() {
        let registry = Arc::new(MetricRegistry::new());
        registry
            .register(MetricSpec::counter("foo_counter", MetricValue::path("n")))
            .unwrap();
        registry
            .register(MetricSpec::histogram("bar_histogram", MetricValue::path("n")))
            .unwrap();
        let mut meta = serde_json::Map::new();
        meta.insert("n".into(), serde_json::Value::from(1));
        registry.observe(&meta);

        let allowlist = Arc::new(MetricAllowlist::new(["foo_*"]).unwrap());
        let batches = Arc::new(Mutex::new(Vec::new()));
        let handle = spawn_exporter(
            registry.clone(),
            allowlist.clone(),
            Box::new(CaptureExporter {
                batches: batches.clone(),
            }),
            Duration::from_millis(100),
            "F".into(),
            "run".into(),
        );
        tokio::time::sleep(Duration::from_millis(350)).await;
        handle.shutdown().await;

        let batches = batches.lock();
        assert!(!batches.is_empty());
        for batch in batches.iter() {
            assert!(batch.metrics.iter().all(|m| m.name == "foo_counter"));
        }
        assert_eq!(allowlist.blocked_names(), vec!["bar_histogram".to_string()]);
    }
}
