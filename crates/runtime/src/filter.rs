//! The filter capability interface
//!
//! User code implements [`Filter`]; the runtime holds values of this
//! trait, drives the lifecycle around them and guarantees `process`
//! never runs concurrently with itself.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde_json::{Map, Value};

use openfilter_core::config::FilterConfig;
use openfilter_core::frame::Frame;
use openfilter_core::metrics::MetricSpec;
use openfilter_core::{Result, Run};

/// Lifecycle state of a filter instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    /// Created, not yet configured
    Init,
    /// Parsing config, binding sockets, registering metrics
    SettingUp,
    /// Ticking
    Running,
    /// Stop received, draining in-flight frames
    Draining,
    /// Running the user shutdown hook
    ShuttingDown,
    /// Done
    Terminated,
}

impl FilterState {
    /// Lowercase tag for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterState::Init => "init",
            FilterState::SettingUp => "setting_up",
            FilterState::Running => "running",
            FilterState::Draining => "draining",
            FilterState::ShuttingDown => "shutting_down",
            FilterState::Terminated => "terminated",
        }
    }
}

/// The bundle of frames one `process` call observes.
///
/// One frame per subscribed topic at most; topics without a pending
/// frame are simply absent (loose mode) and ephemeral topics carry their
/// latest frame, which may be stale.
#[derive(Debug, Default)]
pub struct Tick {
    frames: BTreeMap<String, Frame>,
}

impl Tick {
    /// Empty tick
    pub fn new() -> Self {
        Tick::default()
    }

    /// Build from topic/frame pairs
    pub fn from_frames(frames: impl IntoIterator<Item = Frame>) -> Self {
        let mut tick = Tick::new();
        for frame in frames {
            tick.insert(frame);
        }
        tick
    }

    /// Add a frame under its topic
    pub fn insert(&mut self, frame: Frame) {
        self.frames.insert(frame.topic.clone(), frame);
    }

    /// Frame on a topic, if present
    pub fn get(&self, topic: &str) -> Option<&Frame> {
        self.frames.get(topic)
    }

    /// Remove and return the frame on a topic
    pub fn take(&mut self, topic: &str) -> Option<Frame> {
        self.frames.remove(topic)
    }

    /// Topics present in this tick
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.frames.keys().map(String::as_str)
    }

    /// Frames in topic order
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.values()
    }

    /// Number of frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frames are present
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Consume into frames, topic order
    pub fn into_frames(self) -> impl Iterator<Item = Frame> {
        self.frames.into_values()
    }
}

/// Runtime context handed to every user hook.
///
/// Carries the filter identity, the shared run, the frozen config and a
/// scratch store for state that outlives a single hook call.
pub struct FilterContext {
    /// Immutable filter id
    pub id: String,
    /// Run shared by every filter of the launch
    pub run: Run,
    /// Frozen configuration
    pub config: FilterConfig,
    scratch: Mutex<Map<String, Value>>,
    stop_requested: std::sync::atomic::AtomicBool,
}

impl FilterContext {
    /// Build a context
    pub fn new(run: Run, config: FilterConfig) -> Self {
        FilterContext {
            id: config.id.clone(),
            run,
            config,
            scratch: Mutex::new(Map::new()),
            stop_requested: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Ask the supervisor for a clean stop after the current tick.
    ///
    /// This is how source filters end a pipeline on their own: the
    /// filter drains and terminates as if a stop signal had arrived.
    pub fn request_stop(&self) {
        self.stop_requested
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }

    /// Whether a stop was requested from inside `process`
    pub fn stop_requested(&self) -> bool {
        self.stop_requested
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Read a scratch value
    pub fn get(&self, key: &str) -> Option<Value> {
        self.scratch.lock().get(key).cloned()
    }

    /// Write a scratch value
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.scratch.lock().insert(key.into(), value.into());
    }
}

/// A frame processor.
///
/// The runtime calls `setup` once, `process` once per synchronized tick
/// and `shutdown` once, in that order, all from a single logical thread.
/// Frames returned from `process` are routed through the filter's
/// outputs; frames whose topic matches no output rule are dropped with a
/// once-per-run warning.
pub trait Filter: Send {
    /// Prepare resources. A returned error is fatal for the filter.
    fn setup(&mut self, ctx: &FilterContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Transform one tick into output frames.
    ///
    /// Errors are logged and the tick is dropped; repeated failures
    /// escalate to a fatal lifecycle error.
    fn process(&mut self, ctx: &FilterContext, tick: Tick) -> Result<Vec<Frame>>;

    /// Release resources. `was_killed` is true when the drain deadline
    /// expired before the filter went down on its own.
    fn shutdown(&mut self, was_killed: bool) -> Result<()> {
        let _ = was_killed;
        Ok(())
    }

    /// Metrics this filter wants collected each tick
    fn metric_specs(&self) -> Vec<MetricSpec> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_accessors() {
        let mut a = Frame::new("a");
        a.id = 1;
        let mut b = Frame::new("b");
        b.id = 2;
        let mut tick = Tick::from_frames([a, b]);
        assert_eq!(tick.len(), 2);
        assert_eq!(tick.get("a").unwrap().id, 1);
        assert_eq!(tick.topics().collect::<Vec<_>>(), vec!["a", "b"]);
        let taken = tick.take("b").unwrap();
        assert_eq!(taken.id, 2);
        assert_eq!(tick.len(), 1);
    }

    #[test]
    fn test_context_scratch() {
        let run = Run::new("test");
        let config = openfilter_core::config::normalize("F", Map::new()).unwrap();
        let ctx = FilterContext::new(run, config);
        assert_eq!(ctx.get("k"), None);
        ctx.set("k", 7);
        assert_eq!(ctx.get("k"), Some(Value::from(7)));
    }
}
