//! Multi-filter launcher
//!
//! Runs N filters as a supervised group with correlated exit. Every
//! filter gets its own worker: a dedicated OS thread driving a
//! single-threaded tokio runtime, so one stuck filter cannot starve its
//! siblings and the user-visible contract stays single-threaded.
//!
//! The three-knob exit protocol:
//! - `propagate_exit`: this filter's termination stops siblings that
//!   obey
//! - `obey_exit`: accept stop from propagating siblings
//! - `stop_exit`: count toward the "pipeline done" quorum; when every
//!   such filter has terminated, the launcher stops the rest
//!
//! A worker that ignores its stop past the shutdown grace is abandoned,
//! never joined: a stuck child cannot prevent the launcher from exiting.

use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use openfilter_core::config::{self, FilterConfig};
use openfilter_core::{Error, Run};

use crate::filter::Filter;
use crate::plugins::PluginRegistry;
use crate::supervisor::{self, WorkerControl};

/// `SHUTDOWN_GRACE_S` — wait for stopping workers before abandonment
pub const ENV_SHUTDOWN_GRACE_S: &str = "SHUTDOWN_GRACE_S";
/// `STARTUP_TIMEOUT_S` — per-filter deadline for reaching ready
pub const ENV_STARTUP_TIMEOUT_S: &str = "STARTUP_TIMEOUT_S";

type FilterFactory = Box<dyn FnOnce() -> Box<dyn Filter> + Send>;

/// One filter to launch: kind, raw config and a constructor
pub struct FilterSpec {
    /// Kind name, used for config normalization and the env prefix
    pub kind: String,
    /// Raw configuration mapping, normalized by the launcher
    pub config: Map<String, Value>,
    factory: FilterFactory,
}

impl FilterSpec {
    /// Declare a filter
    pub fn new<F>(kind: impl Into<String>, config: Map<String, Value>, factory: F) -> Self
    where
        F: FnOnce() -> Box<dyn Filter> + Send + 'static,
    {
        FilterSpec {
            kind: kind.into(),
            config,
            factory: Box::new(factory),
        }
    }
}

/// Launcher tuning, resolved from the environment by default
#[derive(Debug, Clone)]
pub struct LauncherOptions {
    /// Wait for each filter's ready before starting the next
    pub sequential_startup: bool,
    /// Per-filter deadline for reaching ready
    pub startup_timeout: Duration,
    /// Wait for stopping workers before abandonment
    pub shutdown_grace: Duration,
    /// Producing application name stamped into the run
    pub producer: String,
    /// External scheme plugins shared by all filters
    pub plugins: PluginRegistry,
}

impl Default for LauncherOptions {
    fn default() -> Self {
        LauncherOptions {
            sequential_startup: false,
            startup_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(15),
            producer: "openfilter".to_string(),
            plugins: PluginRegistry::new(),
        }
    }
}

impl LauncherOptions {
    /// Defaults overlaid with `SHUTDOWN_GRACE_S` and `STARTUP_TIMEOUT_S`
    pub fn from_env() -> Self {
        let mut opts = LauncherOptions::default();
        if let Some(secs) = env_secs(ENV_SHUTDOWN_GRACE_S) {
            opts.shutdown_grace = secs;
        }
        if let Some(secs) = env_secs(ENV_STARTUP_TIMEOUT_S) {
            opts.startup_timeout = secs;
        }
        opts
    }
}

fn env_secs(var: &str) -> Option<Duration> {
    let raw = std::env::var(var).ok()?;
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// How one filter ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildOutcome {
    /// Terminated without error
    Clean,
    /// Terminated with a fatal error
    Failed(String),
    /// Never reached ready within the startup timeout
    StartupTimeout,
    /// Ignored its stop past the grace window and was abandoned
    Killed,
}

/// Terminal status of one filter
#[derive(Debug, Clone)]
pub struct ChildStatus {
    /// Filter id
    pub id: String,
    /// How it ended
    pub outcome: ChildOutcome,
}

/// Aggregate result of a launch
#[derive(Debug, Clone)]
pub enum PipelineStatus {
    /// Every filter exited cleanly
    Ok(Vec<ChildStatus>),
    /// At least one filter failed
    PartialFailure(Vec<ChildStatus>),
    /// Configuration failed before anything started
    ConfigError(String),
    /// Interrupted by signal
    Interrupted(Vec<ChildStatus>),
}

impl PipelineStatus {
    /// Whether every filter exited cleanly
    pub fn is_ok(&self) -> bool {
        matches!(self, PipelineStatus::Ok(_))
    }

    /// Per-child statuses, when the launch got that far
    pub fn children(&self) -> &[ChildStatus] {
        match self {
            PipelineStatus::Ok(children)
            | PipelineStatus::PartialFailure(children)
            | PipelineStatus::Interrupted(children) => children,
            PipelineStatus::ConfigError(_) => &[],
        }
    }

    /// OS exit code: 0 ok, 1 any failure, 2 config error, 130 interrupted
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineStatus::Ok(_) => 0,
            PipelineStatus::PartialFailure(_) => 1,
            PipelineStatus::ConfigError(_) => 2,
            PipelineStatus::Interrupted(_) => 130,
        }
    }
}

struct Worker {
    id: String,
    propagate_exit: bool,
    obey_exit: bool,
    stop_exit: bool,
    stop: watch::Sender<bool>,
    outcome: Option<ChildOutcome>,
}

enum WorkerEvent {
    Terminated { index: usize, outcome: ChildOutcome },
}

/// Run a list of filters until the pipeline terminates.
///
/// Blocks the calling thread. Every filter shares one `run_id` (honoring
/// `RUN_ID`), which is also exported so spawned collaborators correlate.
pub fn run_multi(specs: Vec<FilterSpec>, opts: LauncherOptions) -> PipelineStatus {
    // normalize every config before anything starts: config errors are a
    // startup-stage failure for the whole pipeline
    let mut prepared = Vec::with_capacity(specs.len());
    for spec in specs {
        match config::normalize(&spec.kind, spec.config.clone()) {
            Ok(config) => prepared.push((config, spec.factory)),
            Err(e) => return PipelineStatus::ConfigError(e.to_string()),
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => return PipelineStatus::ConfigError(format!("runtime: {e}")),
    };
    runtime.block_on(supervise(prepared, opts))
}

async fn supervise(
    prepared: Vec<(FilterConfig, FilterFactory)>,
    opts: LauncherOptions,
) -> PipelineStatus {
    let run = Run::from_env(&opts.producer);
    run.export_env();
    tracing::info!(run_id = %run.run_id, filters = prepared.len(), "launching pipeline");

    let (events_tx, mut events_rx) = mpsc::channel::<WorkerEvent>(prepared.len().max(1));
    let mut workers: Vec<Worker> = Vec::with_capacity(prepared.len());
    let mut readies: Vec<Option<oneshot::Receiver<()>>> = Vec::with_capacity(prepared.len());

    // start children in declared order
    for (index, (config, factory)) in prepared.into_iter().enumerate() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        workers.push(Worker {
            id: config.id.clone(),
            propagate_exit: config.propagate_exit,
            obey_exit: config.obey_exit,
            stop_exit: config.stop_exit,
            stop: stop_tx,
            outcome: None,
        });
        spawn_worker(
            index,
            config,
            factory,
            run.clone(),
            opts.plugins.clone(),
            WorkerControl {
                stop: stop_rx,
                ready: Some(ready_tx),
            },
            events_tx.clone(),
        );
        if opts.sequential_startup {
            wait_ready(&mut workers, index, ready_rx, opts.startup_timeout).await;
            readies.push(None);
        } else {
            readies.push(Some(ready_rx));
        }
    }
    drop(events_tx);
    if !opts.sequential_startup {
        for (index, ready) in readies.into_iter().enumerate() {
            if let Some(ready) = ready {
                wait_ready(&mut workers, index, ready, opts.startup_timeout).await;
            }
        }
    }

    // startup timeouts may have settled some outcomes already
    let quorum_armed = workers.iter().any(|w| w.stop_exit);
    let mut quorum = workers
        .iter()
        .filter(|w| w.stop_exit && w.outcome.is_none())
        .count();
    let mut interrupted = false;

    // watch children until the quorum empties, everything exits, or a
    // signal arrives
    loop {
        if workers.iter().all(|w| w.outcome.is_some()) {
            break;
        }
        if quorum_armed && quorum == 0 {
            tracing::info!("exit quorum reached, stopping remaining filters");
            break;
        }
        tokio::select! {
            event = events_rx.recv() => {
                let Some(WorkerEvent::Terminated { index, outcome }) = event else {
                    break;
                };
                record_exit(&mut workers, index, outcome, &mut quorum);
            }
            _ = interrupt_signal() => {
                tracing::info!("interrupt received, stopping pipeline");
                interrupted = true;
                break;
            }
        }
    }

    // broadcast stop and wait out the grace window
    for worker in workers.iter().filter(|w| w.outcome.is_none()) {
        let _ = worker.stop.send(true);
    }
    let grace_deadline = Instant::now() + opts.shutdown_grace;
    while workers.iter().any(|w| w.outcome.is_none()) {
        tokio::select! {
            event = events_rx.recv() => {
                match event {
                    Some(WorkerEvent::Terminated { index, outcome }) => {
                        record_exit(&mut workers, index, outcome, &mut quorum);
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(grace_deadline) => break,
            _ = interrupt_signal() => {
                tracing::warn!("second interrupt, abandoning remaining filters");
                interrupted = true;
                break;
            }
        }
    }

    // hard-kill is abandonment: the stuck worker thread is never joined
    let children: Vec<ChildStatus> = workers
        .iter()
        .map(|w| ChildStatus {
            id: w.id.clone(),
            outcome: w.outcome.clone().unwrap_or_else(|| {
                tracing::warn!(filter_id = %w.id, "worker ignored stop, abandoned");
                ChildOutcome::Killed
            }),
        })
        .collect();

    let clean = children
        .iter()
        .all(|c| matches!(c.outcome, ChildOutcome::Clean));
    let status = if interrupted {
        PipelineStatus::Interrupted(children)
    } else if clean {
        PipelineStatus::Ok(children)
    } else {
        PipelineStatus::PartialFailure(children)
    };
    tracing::info!(
        run_id = %run.run_id,
        exit_code = status.exit_code(),
        "pipeline terminated"
    );
    status
}

#[allow(clippy::too_many_arguments)]
fn spawn_worker(
    index: usize,
    config: FilterConfig,
    factory: FilterFactory,
    run: Run,
    plugins: PluginRegistry,
    ctl: WorkerControl,
    events: mpsc::Sender<WorkerEvent>,
) {
    let id = config.id.clone();
    std::thread::Builder::new()
        .name(format!("filter-{id}"))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = events.blocking_send(WorkerEvent::Terminated {
                        index,
                        outcome: ChildOutcome::Failed(format!("runtime: {e}")),
                    });
                    return;
                }
            };
            let outcome = runtime.block_on(async move {
                let filter = factory();
                match supervisor::run_filter(filter, config, run, plugins, ctl).await {
                    Ok(report) => match report.error {
                        None => ChildOutcome::Clean,
                        Some(error) => ChildOutcome::Failed(error),
                    },
                    Err(e) => ChildOutcome::Failed(e.to_string()),
                }
            });
            let _ = events.blocking_send(WorkerEvent::Terminated { index, outcome });
        })
        .expect("spawn worker thread");
}

async fn wait_ready(
    workers: &mut [Worker],
    index: usize,
    ready: oneshot::Receiver<()>,
    timeout: Duration,
) {
    match tokio::time::timeout(timeout, ready).await {
        Ok(Ok(())) => {
            tracing::debug!(filter_id = %workers[index].id, "filter ready");
        }
        // a dropped sender means the worker died in setup; its
        // Terminated event carries the real error
        Ok(Err(_)) => {}
        Err(_) => {
            let err = Error::lifecycle("startup-timeout", "filter never reached ready");
            tracing::error!(filter_id = %workers[index].id, error = %err, "stopping filter");
            let _ = workers[index].stop.send(true);
            workers[index].outcome = Some(ChildOutcome::StartupTimeout);
        }
    }
}

fn record_exit(
    workers: &mut [Worker],
    index: usize,
    outcome: ChildOutcome,
    quorum: &mut usize,
) {
    if workers[index].outcome.is_some() {
        // startup-timeout verdicts stick even when the worker later dies
        return;
    }
    tracing::info!(
        filter_id = %workers[index].id,
        outcome = ?outcome,
        "filter exited"
    );
    workers[index].outcome = Some(outcome);
    if workers[index].stop_exit {
        *quorum = quorum.saturating_sub(1);
    }
    if workers[index].propagate_exit {
        let propagator = workers[index].id.clone();
        for sibling in workers.iter().filter(|w| w.obey_exit && w.outcome.is_none()) {
            tracing::info!(
                from = %propagator,
                to = %sibling.id,
                "propagating exit"
            );
            let _ = sibling.stop.send(true);
        }
    }
}

/// SIGINT or SIGTERM
async fn interrupt_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return std::future::pending().await,
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(PipelineStatus::Ok(vec![]).exit_code(), 0);
        assert_eq!(PipelineStatus::PartialFailure(vec![]).exit_code(), 1);
        assert_eq!(PipelineStatus::ConfigError("x".into()).exit_code(), 2);
        assert_eq!(PipelineStatus::Interrupted(vec![]).exit_code(), 130);
    }

    #[test]
    fn test_config_error_short_circuits() {
        let specs = vec![FilterSpec::new("F", {
            let mut m = Map::new();
            m.insert("sources".into(), Value::from("definitely-not-a-uri"));
            m
        }, || unreachable!("factory must not run on config error"))];
        let status = run_multi(specs, LauncherOptions::default());
        assert_eq!(status.exit_code(), 2);
    }
}
