//! Coordinated-exit protocol across a supervised group

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use openfilter_core::frame::Frame;
use openfilter_core::Result;
use openfilter_runtime::filter::{Filter, FilterContext, Tick};
use openfilter_runtime::launcher::{run_multi, ChildOutcome, FilterSpec, LauncherOptions};

fn config_map(v: Value) -> Map<String, Value> {
    v.as_object().unwrap().clone()
}

/// Records shutdowns and optionally stops itself after N ticks
struct Probe {
    id: &'static str,
    stop_after: Option<u32>,
    ticks: AtomicU32,
    shutdowns: Arc<Mutex<Vec<(String, bool)>>>,
}

impl Filter for Probe {
    fn process(&mut self, ctx: &FilterContext, _tick: Tick) -> Result<Vec<Frame>> {
        std::thread::sleep(Duration::from_millis(20));
        let ticks = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(limit) = self.stop_after {
            if ticks >= limit {
                ctx.request_stop();
            }
        }
        Ok(Vec::new())
    }

    fn shutdown(&mut self, was_killed: bool) -> Result<()> {
        self.shutdowns.lock().push((self.id.to_string(), was_killed));
        Ok(())
    }
}

/// X propagates its exit; Y obeys; Z has neither knob but is stopped
/// when the quorum (X alone) is satisfied
#[test]
fn test_coordinated_exit() {
    let shutdowns: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let mk = |id: &'static str, stop_after: Option<u32>| {
        let shutdowns = shutdowns.clone();
        move || {
            Box::new(Probe {
                id,
                stop_after,
                ticks: AtomicU32::new(0),
                shutdowns,
            }) as Box<dyn Filter>
        }
    };

    let specs = vec![
        FilterSpec::new(
            "X",
            config_map(json!({ "propagate_exit": true })),
            mk("X", Some(3)),
        ),
        FilterSpec::new(
            "Y",
            config_map(json!({ "obey_exit": true })),
            mk("Y", None),
        ),
        FilterSpec::new("Z", Map::new(), mk("Z", None)),
    ];

    let started = Instant::now();
    let status = run_multi(specs, LauncherOptions::default());
    let elapsed = started.elapsed();

    assert!(status.is_ok(), "status: {status:?}");
    let children = status.children();
    assert_eq!(children.len(), 3);
    for child in children {
        assert_eq!(child.outcome, ChildOutcome::Clean, "child {}", child.id);
    }
    // well under startup timeout + grace: the protocol drove the exit
    assert!(elapsed < Duration::from_secs(10), "took {elapsed:?}");

    let shutdowns = shutdowns.lock();
    let ids: Vec<&str> = shutdowns.iter().map(|(id, _)| id.as_str()).collect();
    assert!(ids.contains(&"X"));
    assert!(ids.contains(&"Y"));
    assert!(ids.contains(&"Z"));
    assert!(shutdowns.iter().all(|(_, was_killed)| !was_killed));
}

/// A filter stuck in setup trips the startup timeout without stalling
/// the launcher
#[test]
fn test_startup_timeout() {
    struct StuckSetup;
    impl Filter for StuckSetup {
        fn setup(&mut self, _ctx: &FilterContext) -> Result<()> {
            std::thread::sleep(Duration::from_secs(30));
            Ok(())
        }
        fn process(&mut self, _ctx: &FilterContext, _tick: Tick) -> Result<Vec<Frame>> {
            Ok(Vec::new())
        }
    }

    let specs = vec![FilterSpec::new("Stuck", Map::new(), || {
        Box::new(StuckSetup) as Box<dyn Filter>
    })];
    let opts = LauncherOptions {
        startup_timeout: Duration::from_millis(300),
        shutdown_grace: Duration::from_millis(500),
        ..LauncherOptions::default()
    };

    let started = Instant::now();
    let status = run_multi(specs, opts);
    let elapsed = started.elapsed();

    assert_eq!(status.exit_code(), 1);
    assert_eq!(status.children()[0].outcome, ChildOutcome::StartupTimeout);
    assert!(elapsed < Duration::from_secs(10), "took {elapsed:?}");
}

/// Sequential startup waits for each filter's ready before spawning the
/// next; ready order must match declaration order
#[test]
fn test_sequential_startup_order() {
    static ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    struct Ordered {
        id: &'static str,
    }
    impl Filter for Ordered {
        fn setup(&mut self, _ctx: &FilterContext) -> Result<()> {
            std::thread::sleep(Duration::from_millis(50));
            ORDER.lock().push(self.id);
            Ok(())
        }
        fn process(&mut self, ctx: &FilterContext, _tick: Tick) -> Result<Vec<Frame>> {
            ctx.request_stop();
            Ok(Vec::new())
        }
    }

    let specs = vec![
        FilterSpec::new(
            "First",
            config_map(json!({ "propagate_exit": true })),
            || Box::new(Ordered { id: "First" }) as Box<dyn Filter>,
        ),
        FilterSpec::new("Second", Map::new(), || {
            Box::new(Ordered { id: "Second" }) as Box<dyn Filter>
        }),
        FilterSpec::new("Third", Map::new(), || {
            Box::new(Ordered { id: "Third" }) as Box<dyn Filter>
        }),
    ];
    let status = run_multi(
        specs,
        LauncherOptions {
            sequential_startup: true,
            ..LauncherOptions::default()
        },
    );
    assert!(status.is_ok(), "status: {status:?}");
    assert_eq!(*ORDER.lock(), vec!["First", "Second", "Third"]);
}

/// A failing filter yields PartialFailure while a clean sibling stays
/// clean
#[test]
fn test_partial_failure_aggregation() {
    struct FailsSetup;
    impl Filter for FailsSetup {
        fn setup(&mut self, _ctx: &FilterContext) -> Result<()> {
            Err(openfilter_core::Error::lifecycle(
                "setup-failed",
                "model file missing",
            ))
        }
        fn process(&mut self, _ctx: &FilterContext, _tick: Tick) -> Result<Vec<Frame>> {
            Ok(Vec::new())
        }
    }

    let shutdowns: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let shutdowns2 = shutdowns.clone();
    let specs = vec![
        FilterSpec::new(
            "Bad",
            config_map(json!({ "propagate_exit": true })),
            || Box::new(FailsSetup) as Box<dyn Filter>,
        ),
        FilterSpec::new(
            "Good",
            config_map(json!({ "obey_exit": true })),
            move || {
                Box::new(Probe {
                    id: "Good",
                    stop_after: None,
                    ticks: AtomicU32::new(0),
                    shutdowns: shutdowns2,
                }) as Box<dyn Filter>
            },
        ),
    ];

    let status = run_multi(specs, LauncherOptions::default());
    assert_eq!(status.exit_code(), 1);
    let children = status.children();
    assert!(matches!(children[0].outcome, ChildOutcome::Failed(_)));
    assert_eq!(children[1].outcome, ChildOutcome::Clean);
    assert_eq!(shutdowns.lock().len(), 1);
}
