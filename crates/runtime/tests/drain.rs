//! Drain-deadline behavior when user code overruns a stop

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};

use openfilter_core::config;
use openfilter_core::frame::Frame;
use openfilter_core::{Result, Run};
use openfilter_runtime::filter::{Filter, FilterContext, Tick};
use openfilter_runtime::plugins::PluginRegistry;
use openfilter_runtime::supervisor::{run_filter, WorkerControl};

fn config_map(v: Value) -> Map<String, Value> {
    v.as_object().unwrap().clone()
}

/// Sleeps far past the drain deadline inside `process`
struct Sleeper {
    killed_flag: Arc<AtomicBool>,
}

impl Filter for Sleeper {
    fn process(&mut self, _ctx: &FilterContext, _tick: Tick) -> Result<Vec<Frame>> {
        std::thread::sleep(Duration::from_secs(3));
        Ok(Vec::new())
    }

    fn shutdown(&mut self, was_killed: bool) -> Result<()> {
        if was_killed {
            self.killed_flag.store(true, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_drain_deadline_abandons_stuck_process() {
    let killed_flag = Arc::new(AtomicBool::new(false));
    let cfg = config::normalize(
        "Sleeper",
        config_map(json!({ "drain_deadline_ms": 300 })),
    )
    .unwrap();

    let (stop, ctl) = WorkerControl::standalone();
    let filter = Sleeper {
        killed_flag: killed_flag.clone(),
    };
    let started = Instant::now();
    let worker = tokio::spawn(run_filter(
        Box::new(filter),
        cfg,
        Run::new("test"),
        PluginRegistry::new(),
        ctl,
    ));

    // let the filter get into its 3 s process call, then stop it
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop.send(true).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(2), worker)
        .await
        .expect("supervisor must exit at the drain deadline, not after user code")
        .unwrap()
        .unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    assert!(report.error.is_none());

    // the abandoned call still runs the shutdown hook with the kill flag
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(
        killed_flag.load(Ordering::Relaxed),
        "shutdown(was_killed=true) never ran"
    );
}

/// A stop between ticks drains promptly without the kill flag
#[tokio::test(flavor = "multi_thread")]
async fn test_clean_drain_between_ticks() {
    struct Quick {
        clean_flag: Arc<AtomicBool>,
    }
    impl Filter for Quick {
        fn process(&mut self, _ctx: &FilterContext, _tick: Tick) -> Result<Vec<Frame>> {
            std::thread::sleep(Duration::from_millis(5));
            Ok(Vec::new())
        }
        fn shutdown(&mut self, was_killed: bool) -> Result<()> {
            if !was_killed {
                self.clean_flag.store(true, Ordering::Relaxed);
            }
            Ok(())
        }
    }

    let clean_flag = Arc::new(AtomicBool::new(false));
    let cfg = config::normalize("Quick", Map::new()).unwrap();
    let (stop, ctl) = WorkerControl::standalone();
    let worker = tokio::spawn(run_filter(
        Box::new(Quick {
            clean_flag: clean_flag.clone(),
        }),
        cfg,
        Run::new("test"),
        PluginRegistry::new(),
        ctl,
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    stop.send(true).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("filter never exited")
        .unwrap()
        .unwrap();
    assert!(report.error.is_none());
    assert!(clean_flag.load(Ordering::Relaxed));
}

/// Repeated process failures escalate to a fatal drain
#[tokio::test(flavor = "multi_thread")]
async fn test_repeated_failures_escalate() {
    struct AlwaysFails;
    impl Filter for AlwaysFails {
        fn process(&mut self, _ctx: &FilterContext, _tick: Tick) -> Result<Vec<Frame>> {
            Err(openfilter_core::Error::user_process("bad tick"))
        }
    }

    let cfg = config::normalize("AlwaysFails", Map::new()).unwrap();
    let (_stop, ctl) = WorkerControl::standalone();
    let worker = tokio::spawn(run_filter(
        Box::new(AlwaysFails),
        cfg,
        Run::new("test"),
        PluginRegistry::new(),
        ctl,
    ));

    let report = tokio::time::timeout(Duration::from_secs(30), worker)
        .await
        .expect("escalation never happened")
        .unwrap()
        .unwrap();
    let error = report.error.expect("must report a fatal error");
    assert!(error.contains("process failures"), "error: {error}");
}

/// A panic in process is caught, logged and the filter keeps running
#[tokio::test(flavor = "multi_thread")]
async fn test_panic_does_not_kill_filter() {
    struct PanicsOnce {
        panicked: bool,
    }
    impl Filter for PanicsOnce {
        fn process(&mut self, ctx: &FilterContext, _tick: Tick) -> Result<Vec<Frame>> {
            if !self.panicked {
                self.panicked = true;
                panic!("one bad tick");
            }
            ctx.request_stop();
            Ok(Vec::new())
        }
    }

    let cfg = config::normalize("PanicsOnce", Map::new()).unwrap();
    let (_stop, ctl) = WorkerControl::standalone();
    let worker = tokio::spawn(run_filter(
        Box::new(PanicsOnce { panicked: false }),
        cfg,
        Run::new("test"),
        PluginRegistry::new(),
        ctl,
    ));

    let report = tokio::time::timeout(Duration::from_secs(10), worker)
        .await
        .expect("filter never exited")
        .unwrap()
        .unwrap();
    // the panic was absorbed; the filter went on and stopped itself
    assert!(report.error.is_none());
}
