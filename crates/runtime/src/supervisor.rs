//! Filter lifecycle supervisor
//!
//! Drives one filter through `SettingUp → Running → Draining →
//! ShuttingDown → Terminated`. The user hooks run on blocking tasks so
//! socket I/O, heartbeats and telemetry keep flowing while `process`
//! works; `process` itself never runs concurrently with itself.
//!
//! A stop signal moves the filter to Draining with a wall-clock
//! deadline. If the deadline expires while `process` is still inside
//! user code, the supervisor abandons the call and exits; the abandoned
//! task invokes `shutdown(was_killed=true)` itself when user code
//! finally returns, so the hook is never skipped, and the launcher's
//! grace window bounds the whole affair.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::Instrument;

use openfilter_core::config::FilterConfig;
use openfilter_core::frame::Frame;
use openfilter_core::metrics::{MetricAllowlist, MetricRegistry};
use openfilter_core::{Error, Result, Run};
use openfilter_transport::{Consumer, ConsumerConfig, ConsumerEvent, Producer, ProducerConfig};

use crate::filter::{Filter, FilterContext, FilterState, Tick};
use crate::plugins::PluginRegistry;
use crate::router::{OutputRoute, RouteSink, Router};
use crate::sampler::SystemSampler;
use crate::sync::{SourceEvent, SyncConfig, Synchronizer, TopicExpectation};
use crate::telemetry::{self, lineage, TelemetryConfig};

/// Escalation window for repeated `process` failures
const FAILURE_WINDOW: Duration = Duration::from_secs(10);

/// Failures within the window that escalate to fatal
const FAILURE_LIMIT: usize = 100;

/// System CPU/memory sampling period
const SYSTEM_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Terminal report for one filter
#[derive(Debug)]
pub struct FilterReport {
    /// Filter id
    pub id: String,
    /// Fatal error, if the filter failed while running
    pub error: Option<String>,
    /// Frames ingested by the synchronizer
    pub frames_in: u64,
    /// Frames published through the router
    pub frames_out: u64,
}

/// Launcher-side handles into one worker
pub struct WorkerControl {
    /// Becomes true when the filter should stop
    pub stop: watch::Receiver<bool>,
    /// Fired once setup succeeded
    pub ready: Option<oneshot::Sender<()>>,
}

impl WorkerControl {
    /// Control pair for running a filter outside a launcher
    pub fn standalone() -> (watch::Sender<bool>, WorkerControl) {
        let (stop_tx, stop) = watch::channel(false);
        (stop_tx, WorkerControl { stop, ready: None })
    }
}

type HookCell = Arc<Mutex<Option<Box<dyn Filter>>>>;

enum ProcessOutcome {
    Done(Result<Vec<Frame>>),
    /// Drain deadline expired while user code was running
    Abandoned,
}

/// Run one filter to completion.
///
/// Errors cover the setting-up stage (config, binds, user setup); once
/// running, fatal conditions are reported in [`FilterReport::error`].
pub async fn run_filter(
    filter: Box<dyn Filter>,
    config: FilterConfig,
    run: Run,
    plugins: PluginRegistry,
    ctl: WorkerControl,
) -> Result<FilterReport> {
    let span = tracing::info_span!("filter", filter_id = %config.id, run_id = %run.run_id);
    run_filter_inner(filter, config, run, plugins, ctl)
        .instrument(span)
        .await
}

async fn run_filter_inner(
    filter: Box<dyn Filter>,
    config: FilterConfig,
    run: Run,
    plugins: PluginRegistry,
    mut ctl: WorkerControl,
) -> Result<FilterReport> {
    let mut state = FilterState::SettingUp;
    tracing::info!(state = state.as_str(), kind = %config.kind, "filter starting");

    // metric declarations come off the filter before it moves into the
    // hook cell
    let user_specs = filter.metric_specs();
    let registry = Arc::new(MetricRegistry::new());
    SystemSampler::register_specs(&registry)?;
    registry.register_all(user_specs)?;
    let allowlist = Arc::new(MetricAllowlist::from_env()?);

    let mut router = bind_outputs(&config, &run, &plugins).await?;
    let (input_stop, _) = watch::channel(false);
    let (sync_tx, sync_rx) = mpsc::channel(256);
    let expected = spawn_inputs(&config, &plugins, &sync_tx, &input_stop)?;
    drop(sync_tx);
    let mut synchronizer = Synchronizer::new(
        sync_rx,
        SyncConfig {
            mode: effective_mode(&config),
            window: effective_window(&config),
            expected,
        },
    );

    let ctx = Arc::new(FilterContext::new(run.clone(), config.clone()));
    let hooks: HookCell = Arc::new(Mutex::new(Some(filter)));
    let killed = Arc::new(AtomicBool::new(false));

    if let Err(e) = call_setup(&hooks, &ctx).await {
        let err = Error::lifecycle("setup-failed", e.to_string());
        tracing::error!(error = %err, "filter setup failed");
        router.close();
        return Err(err);
    }

    let telemetry_cfg = TelemetryConfig::from_env()?;
    let telemetry_handle = if telemetry_cfg.enabled {
        let exporter = telemetry::build_exporter(&telemetry_cfg)?;
        Some(telemetry::spawn_exporter(
            registry.clone(),
            allowlist.clone(),
            exporter,
            telemetry_cfg.interval,
            config.id.clone(),
            run.run_id.clone(),
        ))
    } else {
        None
    };
    let emitter = Arc::new(lineage::LineageEmitter::new(
        lineage::LineageConfig::from_env()?,
        run.clone(),
        config.id.clone(),
    ));
    let lineage_handle = if emitter.enabled() {
        Some(lineage::spawn_heartbeat(
            emitter.clone(),
            registry.clone(),
            allowlist.clone(),
        ))
    } else {
        None
    };

    if let Some(ready) = ctl.ready.take() {
        let _ = ready.send(());
    }
    emitter.emit_start().await;
    state = FilterState::Running;
    tracing::info!(state = state.as_str(), "filter running");

    let mut sampler = SystemSampler::new();
    let mut sample_ticker = tokio::time::interval(SYSTEM_SAMPLE_INTERVAL);
    sample_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut failures: VecDeque<Instant> = VecDeque::new();
    let mut out_ids: HashMap<String, u64> = HashMap::new();
    let mut drain_deadline: Option<Instant> = None;
    let mut drain_expired = false;
    let mut fatal_error: Option<String> = None;

    'main: loop {
        // between ticks: honor stop, deadline and the system sampler
        if let Some(deadline) = drain_deadline {
            if Instant::now() >= deadline {
                drain_expired = true;
                tracing::warn!(
                    error = %Error::lifecycle("drain-deadline", "drain deadline expired"),
                    "abandoning drain"
                );
                break 'main;
            }
        }
        let tick = tokio::select! {
            biased;
            _ = ctl.stop.changed(), if state == FilterState::Running => {
                if *ctl.stop.borrow() {
                    state = FilterState::Draining;
                    drain_deadline = Some(Instant::now() + config.drain_deadline());
                    let _ = input_stop.send(true);
                    tracing::info!(state = state.as_str(), "stop received, draining");
                }
                continue;
            }
            _ = sample_ticker.tick() => {
                sampler.sample_system(&registry);
                continue;
            }
            _ = sleep_until_opt(drain_deadline), if drain_deadline.is_some() => {
                continue; // handled by the deadline check above
            }
            tick = synchronizer.next() => tick,
        };
        let Some(tick) = tick else {
            // input side finished (EOS everywhere, or drained after stop)
            break 'main;
        };

        let tick_start = Instant::now();
        let lat_in = input_latency_ms(&tick);
        let input_metas: Vec<serde_json::Map<String, serde_json::Value>> =
            tick.frames().map(|f| f.meta.clone()).collect();

        let mut handle = spawn_process(&hooks, &ctx, tick, &killed);
        let outcome = loop {
            tokio::select! {
                biased;
                joined = &mut handle => {
                    break match joined {
                        Ok(result) => ProcessOutcome::Done(result),
                        Err(join_err) => ProcessOutcome::Done(Err(Error::user_process(
                            format!("process task failed: {join_err}"),
                        ))),
                    };
                }
                _ = ctl.stop.changed(), if state == FilterState::Running => {
                    if *ctl.stop.borrow() {
                        state = FilterState::Draining;
                        drain_deadline = Some(Instant::now() + config.drain_deadline());
                        let _ = input_stop.send(true);
                        tracing::info!(state = state.as_str(), "stop received mid-process, draining");
                    }
                }
                _ = sleep_until_opt(drain_deadline), if drain_deadline.is_some() => {
                    killed.store(true, Ordering::Relaxed);
                    break ProcessOutcome::Abandoned;
                }
            }
        };

        match outcome {
            ProcessOutcome::Done(Ok(frames)) => {
                for meta in &input_metas {
                    registry.observe(meta);
                }
                let lat_out = tick_start.elapsed().as_secs_f64() * 1e3;
                for mut frame in frames {
                    let next_id = out_ids.entry(frame.topic.clone()).or_insert(0);
                    *next_id += 1;
                    frame.id = *next_id;
                    frame.ts = now_ns();
                    frame.src = config.id.clone();
                    frame.sync_runtime_meta();
                    frame.set_runtime_field("fps", trunc3(sampler.fps()));
                    frame.set_runtime_field("lat_in", trunc3(lat_in));
                    frame.set_runtime_field("lat_out", trunc3(lat_out));
                    registry.observe(&frame.meta);
                    if let Err(e) = router.route(frame).await {
                        if e.recoverable() {
                            tracing::warn!(error = %e, "publish failed, frame dropped");
                        } else {
                            fatal_error = Some(e.to_string());
                            break 'main;
                        }
                    }
                }
                sampler.on_tick(&registry, lat_in, lat_out);
                if state == FilterState::Running && ctx.stop_requested() {
                    state = FilterState::Draining;
                    drain_deadline = Some(Instant::now() + config.drain_deadline());
                    let _ = input_stop.send(true);
                    tracing::info!(state = state.as_str(), "stop requested by filter, draining");
                }
            }
            ProcessOutcome::Done(Err(e)) => {
                tracing::warn!(error = %e, "process failed, tick dropped");
                let now = Instant::now();
                failures.push_back(now);
                while failures
                    .front()
                    .map(|t| now - *t > FAILURE_WINDOW)
                    .unwrap_or(false)
                {
                    failures.pop_front();
                }
                if failures.len() >= FAILURE_LIMIT && state == FilterState::Running {
                    fatal_error = Some(format!(
                        "{} process failures within {:?}",
                        failures.len(),
                        FAILURE_WINDOW
                    ));
                    tracing::error!(error = %fatal_error.as_deref().unwrap_or(""), "escalating to fatal, draining");
                    state = FilterState::Draining;
                    drain_deadline = Some(Instant::now() + config.drain_deadline());
                    let _ = input_stop.send(true);
                }
            }
            ProcessOutcome::Abandoned => {
                drain_expired = true;
                tracing::warn!(
                    error = %Error::lifecycle("drain-deadline", "process still running at drain deadline"),
                    "abandoning process call"
                );
                break 'main;
            }
        }
    }

    state = FilterState::ShuttingDown;
    tracing::info!(state = state.as_str(), "filter shutting down");
    let _ = input_stop.send(true);

    // let in-flight frames reach consumers, then signal end-of-stream
    router.flush(Duration::from_secs(2)).await;
    router.finish().await;

    if !killed.load(Ordering::Relaxed) {
        if let Err(e) = call_shutdown(&hooks, drain_expired).await {
            tracing::warn!(error = %e, "shutdown hook failed");
        }
    }

    emitter.emit_complete(fatal_error.as_deref()).await;
    if let Some(handle) = lineage_handle {
        handle.shutdown().await;
    }
    if let Some(handle) = telemetry_handle {
        handle.shutdown().await;
    }
    router.close();

    state = FilterState::Terminated;
    let report = FilterReport {
        id: config.id.clone(),
        error: fatal_error,
        frames_in: synchronizer.stats().frames_in,
        frames_out: router.frames_out(),
    };
    tracing::info!(
        state = state.as_str(),
        frames_in = report.frames_in,
        frames_out = report.frames_out,
        error = report.error.as_deref().unwrap_or(""),
        "filter terminated"
    );
    Ok(report)
}

/// Bind every output endpoint
async fn bind_outputs(
    config: &FilterConfig,
    run: &Run,
    plugins: &PluginRegistry,
) -> Result<Router> {
    let mut routes = Vec::with_capacity(config.outputs.len());
    for output in &config.outputs {
        let sink = if output.endpoint.is_wire() {
            let (host, port) = output.endpoint.host_port()?;
            let producer = Producer::bind(
                &host,
                port,
                config.id.clone(),
                run.run_id.clone(),
                ProducerConfig {
                    outbox_depth: output.options.outbox.unwrap_or(config.outbox),
                    ..ProducerConfig::default()
                },
            )
            .await?;
            RouteSink::Wire(producer)
        } else {
            let plugin = plugins.get(&output.endpoint.scheme)?;
            RouteSink::External(plugin.write(&output.endpoint, &output.options)?)
        };
        routes.push(OutputRoute {
            sink,
            maps: output.topics.clone(),
        });
    }
    Ok(Router::new(routes))
}

/// Connect every source endpoint and start its pump
fn spawn_inputs(
    config: &FilterConfig,
    plugins: &PluginRegistry,
    sync_tx: &mpsc::Sender<SourceEvent>,
    input_stop: &watch::Sender<bool>,
) -> Result<Vec<TopicExpectation>> {
    let mut expected = Vec::new();
    for source in &config.sources {
        let ephemeral = source.ephemerality.is_ephemeral();
        let propagate = source
            .options
            .propagate_eos
            .unwrap_or(config.propagate_eos);
        for map in &source.topics {
            if !map.is_wildcard() {
                expected.push(TopicExpectation {
                    topic: map.dst.clone(),
                    ephemeral,
                });
            }
        }
        let maps = source.topics.clone();
        let tx = sync_tx.clone();
        let stop = input_stop.subscribe();
        if source.endpoint.is_wire() {
            let (host, port) = source.endpoint.host_port()?;
            let consumer = Consumer::connect(
                format!("{host}:{port}"),
                ConsumerConfig {
                    topics: maps.iter().map(|m| m.src.clone()).collect(),
                    ephemerality: source.ephemerality,
                    connect_timeout: source
                        .options
                        .connect_timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or(Duration::from_secs(5)),
                    ..ConsumerConfig::default()
                },
            );
            tokio::spawn(wire_pump(consumer, maps, ephemeral, propagate, tx, stop));
        } else {
            let plugin = plugins.get(&source.endpoint.scheme)?;
            let rx = plugin.open(&source.endpoint, &source.options)?;
            tokio::spawn(external_pump(rx, maps, ephemeral, propagate, tx, stop));
        }
    }
    Ok(expected)
}

/// Forward wire consumer events into the synchronizer, remapping topics
async fn wire_pump(
    mut consumer: Consumer,
    maps: Vec<openfilter_core::endpoint::TopicMap>,
    ephemeral: bool,
    propagate: bool,
    tx: mpsc::Sender<SourceEvent>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = stop.changed() => {
                if *stop.borrow() {
                    consumer.stop();
                    return;
                }
                continue;
            }
            event = consumer.next_event() => event,
        };
        let Some(event) = event else { return };
        match event {
            ConsumerEvent::Frame(mut frame) => {
                let Some(dst) = maps.iter().find_map(|m| m.apply(&frame.topic)) else {
                    tracing::debug!(topic = %frame.topic, "unsubscribed topic, dropping");
                    continue;
                };
                if frame.topic != dst {
                    frame.topic = dst;
                    frame.sync_runtime_meta();
                }
                if tx
                    .send(SourceEvent::Frame { frame, ephemeral })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            ConsumerEvent::Eos { topic } => {
                let Some(dst) = maps.iter().find_map(|m| m.apply(&topic)) else {
                    continue;
                };
                if tx
                    .send(SourceEvent::Eos {
                        topic: dst,
                        propagate,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            ConsumerEvent::Connected { producer_id, .. } => {
                tracing::debug!(upstream = %producer_id, "source connected");
            }
            ConsumerEvent::Disconnected { reason } => {
                tracing::warn!(
                    error = %Error::transport("peer-gone", reason),
                    "source disconnected, reconnecting"
                );
            }
        }
    }
}

/// Forward an external plugin stream into the synchronizer
async fn external_pump(
    mut rx: mpsc::Receiver<Frame>,
    maps: Vec<openfilter_core::endpoint::TopicMap>,
    ephemeral: bool,
    propagate: bool,
    tx: mpsc::Sender<SourceEvent>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = stop.changed() => {
                if *stop.borrow() {
                    return;
                }
                continue;
            }
            frame = rx.recv() => frame,
        };
        let Some(mut frame) = frame else {
            // plugin stream ended: end-of-stream for its declared topics
            for map in &maps {
                if map.is_wildcard() {
                    continue;
                }
                let _ = tx
                    .send(SourceEvent::Eos {
                        topic: map.dst.clone(),
                        propagate,
                    })
                    .await;
            }
            return;
        };
        let Some(dst) = maps.iter().find_map(|m| m.apply(&frame.topic)) else {
            continue;
        };
        frame.topic = dst;
        if tx
            .send(SourceEvent::Frame { frame, ephemeral })
            .await
            .is_err()
        {
            return;
        }
    }
}

/// The strictest mode declared across sources wins
fn effective_mode(config: &FilterConfig) -> openfilter_core::config::SyncMode {
    use openfilter_core::config::SyncMode;
    let mut mode = config.sync;
    for source in &config.sources {
        let source_mode = config.source_sync(source);
        mode = match (mode, source_mode) {
            (_, SyncMode::ById) | (SyncMode::ById, _) => SyncMode::ById,
            (_, SyncMode::Strict) | (SyncMode::Strict, _) => SyncMode::Strict,
            _ => SyncMode::Loose,
        };
    }
    mode
}

/// The tightest declared window wins
fn effective_window(config: &FilterConfig) -> Duration {
    config
        .sources
        .iter()
        .filter_map(|s| s.options.window_ms)
        .min()
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(config.window_ms))
}

fn spawn_process(
    hooks: &HookCell,
    ctx: &Arc<FilterContext>,
    tick: Tick,
    killed: &Arc<AtomicBool>,
) -> tokio::task::JoinHandle<Result<Vec<Frame>>> {
    let hooks = hooks.clone();
    let ctx = ctx.clone();
    let killed = killed.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = hooks.lock();
        let Some(filter) = guard.as_mut() else {
            return Err(Error::lifecycle("gone", "filter already shut down"));
        };
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            filter.process(&ctx, tick)
        }));
        let result = match result {
            Ok(Ok(frames)) => Ok(frames),
            Ok(Err(e)) => Err(Error::user_process(e.to_string())),
            Err(panic) => Err(Error::user_process(panic_message(panic))),
        };
        // the supervisor gave up waiting: the shutdown hook runs here so
        // it is never skipped
        if killed.load(Ordering::Relaxed) {
            if let Some(mut filter) = guard.take() {
                if let Err(e) = filter.shutdown(true) {
                    tracing::warn!(error = %e, "shutdown hook failed after abandonment");
                }
            }
        }
        result
    })
}

async fn call_setup(hooks: &HookCell, ctx: &Arc<FilterContext>) -> Result<()> {
    let hooks = hooks.clone();
    let ctx = ctx.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = hooks.lock();
        let Some(filter) = guard.as_mut() else {
            return Err(Error::lifecycle("gone", "filter already shut down"));
        };
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| filter.setup(&ctx))) {
            Ok(result) => result,
            Err(panic) => Err(Error::lifecycle("setup-failed", panic_message(panic))),
        }
    })
    .await
    .map_err(|e| Error::lifecycle("setup-failed", e.to_string()))?
}

async fn call_shutdown(hooks: &HookCell, was_killed: bool) -> Result<()> {
    let hooks = hooks.clone();
    tokio::task::spawn_blocking(move || {
        let Some(mut filter) = hooks.lock().take() else {
            return Ok(());
        };
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            filter.shutdown(was_killed)
        })) {
            Ok(result) => result,
            Err(panic) => Err(Error::lifecycle("shutdown-failed", panic_message(panic))),
        }
    })
    .await
    .map_err(|e| Error::lifecycle("shutdown-failed", e.to_string()))?
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic in user hook".to_string()
    }
}

/// Mean delivery latency of the tick's frames, milliseconds
fn input_latency_ms(tick: &Tick) -> f64 {
    let now = now_ns();
    let mut sum = 0.0;
    let mut n = 0u32;
    for frame in tick.frames() {
        if frame.ts > 0 && frame.ts <= now {
            sum += (now - frame.ts) as f64 / 1e6;
            n += 1;
        }
    }
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Millisecond-precision values read better in metadata than raw floats
fn trunc3(v: f64) -> f64 {
    (v * 1_000.0).round() / 1_000.0
}

/// Nanoseconds since epoch, UTC
pub fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openfilter_core::config::SyncMode;

    #[test]
    fn test_effective_mode_takes_strictest() {
        let mut config = openfilter_core::config::normalize(
            "F",
            serde_json::Map::new(),
        )
        .unwrap();
        assert_eq!(effective_mode(&config), SyncMode::Loose);
        config.sources =
            openfilter_core::endpoint::parse_sources("tcp://a:1!sync=strict,tcp://b:2").unwrap();
        assert_eq!(effective_mode(&config), SyncMode::Strict);
        config.sources =
            openfilter_core::endpoint::parse_sources("tcp://a:1!sync=strict,tcp://b:2!sync=by_id")
                .unwrap();
        assert_eq!(effective_mode(&config), SyncMode::ById);
    }

    #[test]
    fn test_effective_window_prefers_tightest() {
        let mut config =
            openfilter_core::config::normalize("F", serde_json::Map::new()).unwrap();
        assert_eq!(effective_window(&config), Duration::from_millis(2_000));
        config.sources =
            openfilter_core::endpoint::parse_sources("tcp://a:1!window_ms=900,tcp://b:2!window_ms=400")
                .unwrap();
        assert_eq!(effective_window(&config), Duration::from_millis(400));
    }
}
