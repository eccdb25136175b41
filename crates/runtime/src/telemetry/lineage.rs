//! Lineage event emission
//!
//! Every filter emits a `START` event when it enters the running state,
//! periodic `RUNNING` heartbeats carrying its aggregated metric facets,
//! and a terminal `COMPLETE` (or `FAIL`) event. Events POST to the
//! configured collector; with no collector configured they are traced at
//! debug level and otherwise dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use openfilter_core::metrics::{MetricAllowlist, MetricKind, MetricRegistry};
use openfilter_core::{Error, Result, Run};
use openfilter_transport::Backoff;

/// `LINEAGE_URL` — collector base URL; unset disables emission
pub const ENV_LINEAGE_URL: &str = "LINEAGE_URL";
/// `LINEAGE_API_KEY` — bearer token for the collector
pub const ENV_LINEAGE_API_KEY: &str = "LINEAGE_API_KEY";
/// `LINEAGE_ENDPOINT` — path joined onto the base URL
pub const ENV_LINEAGE_ENDPOINT: &str = "LINEAGE_ENDPOINT";
/// `LINEAGE_HEARTBEAT_S` — heartbeat interval, seconds
pub const ENV_LINEAGE_HEARTBEAT_S: &str = "LINEAGE_HEARTBEAT_S";

/// Heartbeat facet snapshots retained per filter, oldest dropped first
pub const FACET_RETENTION: usize = 100;

/// Resolved lineage configuration
#[derive(Debug, Clone)]
pub struct LineageConfig {
    /// Collector base URL
    pub url: Option<String>,
    /// Bearer token
    pub api_key: Option<String>,
    /// Path joined onto the base URL
    pub endpoint: String,
    /// Heartbeat interval
    pub heartbeat: Duration,
}

impl Default for LineageConfig {
    fn default() -> Self {
        LineageConfig {
            url: None,
            api_key: None,
            endpoint: "/api/v1/lineage".to_string(),
            heartbeat: Duration::from_secs(10),
        }
    }
}

impl LineageConfig {
    /// Resolve from the environment
    pub fn from_env() -> Result<Self> {
        let mut cfg = LineageConfig::default();
        if let Ok(url) = std::env::var(ENV_LINEAGE_URL) {
            if !url.trim().is_empty() {
                cfg.url = Some(url.trim().trim_end_matches('/').to_string());
            }
        }
        if let Ok(key) = std::env::var(ENV_LINEAGE_API_KEY) {
            cfg.api_key = Some(key);
        }
        if let Ok(endpoint) = std::env::var(ENV_LINEAGE_ENDPOINT) {
            if !endpoint.trim().is_empty() {
                cfg.endpoint = endpoint.trim().to_string();
            }
        }
        if let Ok(raw) = std::env::var(ENV_LINEAGE_HEARTBEAT_S) {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                Error::config_field(ENV_LINEAGE_HEARTBEAT_S, format!("not a number: {raw:?}"))
            })?;
            cfg.heartbeat = Duration::from_secs(secs.max(1));
        }
        Ok(cfg)
    }
}

/// Emits lineage events for one filter
pub struct LineageEmitter {
    cfg: LineageConfig,
    run: Run,
    filter_id: String,
    client: reqwest::Client,
    retained: Mutex<VecDeque<Map<String, Value>>>,
}

impl LineageEmitter {
    /// Build an emitter
    pub fn new(cfg: LineageConfig, run: Run, filter_id: impl Into<String>) -> Self {
        LineageEmitter {
            cfg,
            run,
            filter_id: filter_id.into(),
            client: reqwest::Client::new(),
            retained: Mutex::new(VecDeque::with_capacity(FACET_RETENTION)),
        }
    }

    /// Whether a collector is configured
    pub fn enabled(&self) -> bool {
        self.cfg.url.is_some()
    }

    /// Facet snapshots currently retained (newest last)
    pub fn retained_facets(&self) -> usize {
        self.retained.lock().len()
    }

    /// Emit the start-of-life event
    pub async fn emit_start(&self) {
        self.post(self.event("START", Map::new())).await;
    }

    /// Emit the end-of-life event; an error turns it into `FAIL`
    pub async fn emit_complete(&self, error: Option<&str>) {
        let mut facets = Map::new();
        if let Some(message) = error {
            facets.insert(
                "errorMessage".into(),
                json!({ "message": message, "language": "rust" }),
            );
        }
        let kind = if error.is_some() { "FAIL" } else { "COMPLETE" };
        self.post(self.event(kind, facets)).await;
    }

    /// Emit one heartbeat carrying the current aggregated facets
    pub async fn emit_heartbeat(&self, registry: &MetricRegistry, allowlist: &MetricAllowlist) {
        let facets = build_facets(registry, allowlist);
        {
            let mut retained = self.retained.lock();
            if retained.len() == FACET_RETENTION {
                retained.pop_front();
            }
            retained.push_back(facets.clone());
        }
        self.post(self.event("RUNNING", facets)).await;
    }

    fn event(&self, kind: &str, facets: Map<String, Value>) -> Value {
        json!({
            "eventType": kind,
            "eventTime": Utc::now().to_rfc3339(),
            "run": { "runId": self.run.run_id },
            "job": { "namespace": self.run.producer, "name": self.filter_id },
            "producer": self.run.producer,
            "facets": facets,
        })
    }

    async fn post(&self, event: Value) {
        let Some(base) = &self.cfg.url else {
            tracing::debug!(target: "openfilter::lineage", event = %event, "lineage disabled");
            return;
        };
        let url = format!("{base}{}", self.cfg.endpoint);
        let mut backoff = Backoff::new();
        for attempt in 0..3u32 {
            let mut request = self.client.post(&url).json(&event);
            if let Some(key) = &self.cfg.api_key {
                request = request.bearer_auth(key);
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => return,
                Ok(response) => {
                    tracing::warn!(
                        %url,
                        status = %response.status(),
                        attempt,
                        "lineage post rejected"
                    );
                }
                Err(e) => {
                    tracing::warn!(%url, error = %e, attempt, "lineage post failed");
                }
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }
}

/// Aggregated facets keyed by metric name.
///
/// Counters become `{sum}`, gauges `{value}` and histograms
/// `{buckets, counts, count, sum}` where `counts` has one extra slot for
/// the open upper bin; a report violating that arithmetic is dropped
/// with a warning.
pub fn build_facets(registry: &MetricRegistry, allowlist: &MetricAllowlist) -> Map<String, Value> {
    let mut facets = Map::new();
    for metric in registry.snapshot().metrics {
        if !metric.target.lineage() || !allowlist.check(&metric.name) {
            continue;
        }
        let facet = match metric.kind {
            MetricKind::Counter => json!({ "sum": metric.counter }),
            MetricKind::Gauge => match metric.gauge {
                Some(value) => json!({ "value": value }),
                None => continue,
            },
            MetricKind::Histogram => {
                let Some(hist) = metric.histogram else { continue };
                if !hist.consistent() {
                    tracing::warn!(
                        metric = %metric.name,
                        bounds = hist.bounds.len(),
                        counts = hist.counts.len(),
                        "inconsistent histogram facet, dropping"
                    );
                    continue;
                }
                json!({
                    "buckets": hist.bounds,
                    "counts": hist.counts,
                    "count": hist.count,
                    "sum": hist.sum,
                })
            }
        };
        facets.insert(metric.name, facet);
    }
    facets
}

/// Handle on the background heartbeat task
pub struct LineageHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LineageHandle {
    /// Stop heartbeating (terminal events are emitted separately)
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(2), self.task).await;
    }
}

/// Start the heartbeat loop for one filter
pub fn spawn_heartbeat(
    emitter: Arc<LineageEmitter>,
    registry: Arc<MetricRegistry>,
    allowlist: Arc<MetricAllowlist>,
) -> LineageHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let interval = emitter.cfg.heartbeat;
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    emitter.emit_heartbeat(&registry, &allowlist).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    });
    LineageHandle { shutdown, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openfilter_core::metrics::{MetricSpec, MetricTarget, MetricValue};

    #[test]
    fn test_facets_shape_and_allowlist() {
        let registry = MetricRegistry::new();
        registry
            .register(
                MetricSpec::histogram("confidence", MetricValue::path("c")).with_bucket_count(4),
            )
            .unwrap();
        registry
            .register(MetricSpec::counter("frames", MetricValue::path("n")))
            .unwrap();
        registry
            .register(
                MetricSpec::counter("otel_only", MetricValue::path("n"))
                    .with_target(MetricTarget::Otel),
            )
            .unwrap();
        let mut meta = Map::new();
        meta.insert("c".into(), Value::from(0.4));
        meta.insert("n".into(), Value::from(2));
        registry.observe(&meta);

        let allowlist = MetricAllowlist::new(["*"]).unwrap();
        let facets = build_facets(&registry, &allowlist);

        let hist = facets.get("confidence").unwrap();
        let buckets = hist.get("buckets").unwrap().as_array().unwrap();
        let counts = hist.get("counts").unwrap().as_array().unwrap();
        assert_eq!(counts.len(), buckets.len() + 1);
        assert_eq!(hist.get("count").unwrap(), &json!(1));
        assert_eq!(facets.get("frames").unwrap(), &json!({ "sum": 2.0 }));
        // otel-targeted metrics never reach lineage facets
        assert!(!facets.contains_key("otel_only"));
    }

    #[test]
    fn test_retention_cap() {
        let emitter = LineageEmitter::new(
            LineageConfig::default(),
            Run::new("test"),
            "F",
        );
        let mut retained = emitter.retained.lock();
        for _ in 0..(FACET_RETENTION + 20) {
            if retained.len() == FACET_RETENTION {
                retained.pop_front();
            }
            retained.push_back(Map::new());
        }
        assert_eq!(retained.len(), FACET_RETENTION);
    }

    #[tokio::test]
    async fn test_disabled_emitter_is_silent() {
        let emitter = LineageEmitter::new(LineageConfig::default(), Run::new("test"), "F");
        assert!(!emitter.enabled());
        // must return without network activity
        emitter.emit_start().await;
        emitter.emit_complete(None).await;
    }
}
