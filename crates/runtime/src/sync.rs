//! Multi-source tick synchronizer
//!
//! Consumes a merged stream of per-source events (already topic-remapped
//! by the input pumps) and assembles the [`Tick`] each `process` call
//! observes. Three modes:
//!
//! - **Loose**: fire as soon as anything is pending; absent topics are
//!   simply missing from the tick.
//! - **Strict**: fire only when every non-ephemeral topic has a frame
//!   pending, FIFO-aligned.
//! - **By-id**: align non-ephemeral topics on `meta.id`, dropping frames
//!   below the alignment target; a topic that stalls longer than the
//!   window raises a sync warning and the tick advances without it.
//!
//! Ephemeral topics contribute their latest frame (possibly stale) and
//! never block assembly. When every non-ephemeral topic has reported
//! end-of-stream and drained, [`Synchronizer::next`] returns `None`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use openfilter_core::config::SyncMode;
use openfilter_core::frame::Frame;

use crate::filter::Tick;

/// One event from an input pump, topic already remapped
#[derive(Debug)]
pub enum SourceEvent {
    /// A frame arrived
    Frame {
        /// The frame; `frame.topic` is the destination topic
        frame: Frame,
        /// Whether the owning source is ephemeral
        ephemeral: bool,
    },
    /// The topic will not receive further frames
    Eos {
        /// Ended topic (destination name)
        topic: String,
        /// Whether this end-of-stream counts toward filter exit
        propagate: bool,
    },
}

/// A topic the synchronizer should expect before any frame arrives
#[derive(Debug, Clone)]
pub struct TopicExpectation {
    /// Destination topic name
    pub topic: String,
    /// Whether the owning source is ephemeral
    pub ephemeral: bool,
}

/// Synchronizer tuning
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Tick assembly mode
    pub mode: SyncMode,
    /// Stall window for strict and by-id assembly
    pub window: Duration,
    /// Statically declared topics (wildcards are discovered on arrival)
    pub expected: Vec<TopicExpectation>,
}

/// Drop and error counters
#[derive(Debug, Default, Clone)]
pub struct SyncStats {
    /// Frames dropped per topic by by-id alignment
    pub alignment_drops: HashMap<String, u64>,
    /// Stall windows expired
    pub sync_errors: u64,
    /// Frames ingested
    pub frames_in: u64,
}

#[derive(Debug)]
struct TopicState {
    ephemeral: bool,
    fifo: VecDeque<(Frame, Instant)>,
    latest: Option<Frame>,
    fresh: bool,
    ended: bool,
    exit_on_end: bool,
}

impl TopicState {
    fn new(ephemeral: bool) -> Self {
        TopicState {
            ephemeral,
            fifo: VecDeque::new(),
            latest: None,
            fresh: false,
            ended: false,
            exit_on_end: true,
        }
    }

    /// Still participates in strict/by-id assembly
    fn required(&self) -> bool {
        !self.ephemeral && !(self.ended && self.fifo.is_empty())
    }
}

/// Assembles ticks from a merged source-event stream
pub struct Synchronizer {
    rx: mpsc::Receiver<SourceEvent>,
    mode: SyncMode,
    window: Duration,
    topics: BTreeMap<String, TopicState>,
    stats: SyncStats,
    expired: bool,
    closed: bool,
}

impl Synchronizer {
    /// Build over a merged event stream
    pub fn new(rx: mpsc::Receiver<SourceEvent>, cfg: SyncConfig) -> Self {
        let mut topics = BTreeMap::new();
        for expectation in cfg.expected {
            topics.insert(
                expectation.topic.clone(),
                TopicState::new(expectation.ephemeral),
            );
        }
        Synchronizer {
            rx,
            mode: cfg.mode,
            window: cfg.window,
            topics,
            stats: SyncStats::default(),
            expired: false,
            closed: false,
        }
    }

    /// Drop and error counters
    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// Next tick, or `None` when the input side is finished.
    ///
    /// A filter with no subscribed topics gets empty ticks: source
    /// filters pace themselves inside `process`.
    pub async fn next(&mut self) -> Option<Tick> {
        loop {
            while let Ok(event) = self.rx.try_recv() {
                self.ingest(event);
            }
            if let Some(tick) = self.try_assemble() {
                return Some(tick);
            }
            if self.topics.is_empty() && !self.closed {
                tokio::task::yield_now().await;
                return Some(Tick::new());
            }
            if self.exhausted() {
                return None;
            }

            let deadline = self.stall_deadline();
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.ingest(event),
                    None => self.close_input(),
                },
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    self.expired = true;
                }
            }
        }
    }

    fn ingest(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Frame { frame, ephemeral } => {
                self.stats.frames_in += 1;
                let state = self
                    .topics
                    .entry(frame.topic.clone())
                    .or_insert_with(|| TopicState::new(ephemeral));
                if state.ephemeral {
                    state.latest = Some(frame);
                    state.fresh = true;
                } else {
                    state.fifo.push_back((frame, Instant::now()));
                }
            }
            SourceEvent::Eos { topic, propagate } => {
                let state = self
                    .topics
                    .entry(topic)
                    .or_insert_with(|| TopicState::new(false));
                state.ended = true;
                state.exit_on_end = propagate;
            }
        }
    }

    /// Input pumps are gone (stop signal): finish whatever is queued
    fn close_input(&mut self) {
        self.closed = true;
        for state in self.topics.values_mut() {
            state.ended = true;
            state.exit_on_end = true;
        }
    }

    fn exhausted(&self) -> bool {
        if self.closed && self.topics.is_empty() {
            return true;
        }
        let mut saw_required_class = false;
        for state in self.topics.values() {
            if state.ephemeral {
                continue;
            }
            saw_required_class = true;
            if !(state.ended && state.fifo.is_empty() && state.exit_on_end) {
                return false;
            }
        }
        saw_required_class
    }

    /// Deadline after which a stalled strict/by-id assembly advances
    fn stall_deadline(&self) -> Option<Instant> {
        if self.mode == SyncMode::Loose {
            return None;
        }
        let mut waiting_since: Option<Instant> = None;
        let mut any_empty_required = false;
        for state in self.topics.values() {
            if !state.required() {
                continue;
            }
            match state.fifo.front() {
                Some((_, arrived)) => {
                    waiting_since = Some(match waiting_since {
                        Some(t) if t < *arrived => t,
                        _ => *arrived,
                    });
                }
                None if !state.ended => any_empty_required = true,
                None => {}
            }
        }
        match (any_empty_required, waiting_since) {
            (true, Some(oldest)) => Some(oldest + self.window),
            _ => None,
        }
    }

    fn try_assemble(&mut self) -> Option<Tick> {
        match self.mode {
            SyncMode::Loose => self.assemble_loose(),
            SyncMode::Strict => self.assemble_strict(),
            SyncMode::ById => self.assemble_by_id(),
        }
    }

    fn assemble_loose(&mut self) -> Option<Tick> {
        let any_pending = self.topics.values().any(|s| {
            (!s.ephemeral && !s.fifo.is_empty()) || (s.ephemeral && s.fresh)
        });
        if !any_pending {
            return None;
        }
        let mut tick = Tick::new();
        for state in self.topics.values_mut() {
            if state.ephemeral {
                state.fresh = false;
                if let Some(latest) = &state.latest {
                    tick.insert(latest.clone());
                }
            } else if let Some((frame, _)) = state.fifo.pop_front() {
                tick.insert(frame);
            }
        }
        Some(tick)
    }

    fn assemble_strict(&mut self) -> Option<Tick> {
        let required: Vec<&String> = self
            .topics
            .iter()
            .filter(|(_, s)| s.required())
            .map(|(t, _)| t)
            .collect();
        if required.is_empty() {
            self.expired = false;
            return None;
        }
        let all_ready = self
            .topics
            .values()
            .filter(|s| s.required())
            .all(|s| !s.fifo.is_empty());
        if !all_ready {
            if !self.expired {
                return None;
            }
            // stall window expired: advance past the missing topics
            self.expired = false;
            let any_waiting = self
                .topics
                .values()
                .any(|s| s.required() && !s.fifo.is_empty());
            if !any_waiting {
                return None;
            }
            self.stats.sync_errors += 1;
            tracing::warn!(
                window_ms = self.window.as_millis() as u64,
                "tick deadline exceeded, delivering partial tick"
            );
        }
        self.expired = false;
        let mut tick = Tick::new();
        for state in self.topics.values_mut() {
            if state.ephemeral {
                state.fresh = false;
                if let Some(latest) = &state.latest {
                    tick.insert(latest.clone());
                }
            } else if let Some((frame, _)) = state.fifo.pop_front() {
                tick.insert(frame);
            }
        }
        Some(tick)
    }

    fn assemble_by_id(&mut self) -> Option<Tick> {
        let all_ready = {
            let mut any_required = false;
            let mut ready = true;
            for state in self.topics.values() {
                if state.required() {
                    any_required = true;
                    if state.fifo.is_empty() {
                        ready = false;
                    }
                }
            }
            if !any_required {
                self.expired = false;
                return None;
            }
            ready
        };

        if !all_ready && !self.expired {
            return None;
        }
        let partial = !all_ready;
        self.expired = false;

        // alignment target: the largest head id among waiting topics
        let target = self
            .topics
            .values()
            .filter(|s| s.required())
            .filter_map(|s| s.fifo.front().map(|(f, _)| f.id))
            .max()?;

        // advance past frames below the target, counting drops
        for (topic, state) in self.topics.iter_mut() {
            if !state.required() {
                continue;
            }
            while state
                .fifo
                .front()
                .map(|(f, _)| f.id < target)
                .unwrap_or(false)
            {
                state.fifo.pop_front();
                *self.stats.alignment_drops.entry(topic.clone()).or_insert(0) += 1;
            }
        }

        // a fifo that emptied while advancing needs more input
        if !partial {
            let still_ready = self
                .topics
                .values()
                .filter(|s| s.required())
                .all(|s| s.fifo.front().map(|(f, _)| f.id == target).unwrap_or(false));
            if !still_ready {
                return None;
            }
        }

        let mut tick = Tick::new();
        for state in self.topics.values_mut() {
            if state.ephemeral {
                state.fresh = false;
                if let Some(latest) = &state.latest {
                    tick.insert(latest.clone());
                }
            } else if state
                .fifo
                .front()
                .map(|(f, _)| f.id == target)
                .unwrap_or(false)
            {
                let (frame, _) = state.fifo.pop_front().expect("head checked");
                tick.insert(frame);
            }
        }
        if tick.is_empty() {
            return None;
        }
        if partial {
            self.stats.sync_errors += 1;
            tracing::warn!(
                target_id = target,
                window_ms = self.window.as_millis() as u64,
                "tick deadline exceeded, aligning without stalled topics"
            );
        }
        Some(tick)
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
