//! Publish side of an output endpoint
//!
//! A [`Producer`] binds a TCP listener and serves any number of
//! consumers. Each accepted connection gets a `hello`, then declares
//! itself with `subscribe` — or stays silent, which makes it doubly
//! ephemeral: it is served on a best-effort latest-frame slot and no
//! per-consumer flow state is kept for it.
//!
//! Flow control: every non-ephemeral consumer owns a bounded outbox;
//! [`Producer::publish`] awaits capacity on each of them, so one full
//! outbox backpressures the whole filter. Ephemeral consumers get a
//! 1-deep drop-oldest slot and can never hold the producer back.
//!
//! Each consumer is served by a reader task (pongs, resubscribes) and a
//! writer task (outbox drain plus heartbeat). Five consecutive missed
//! pongs evict the slot; the pipeline continues without it.

use std::collections::{BTreeSet, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};

use openfilter_core::frame::codec::{self, EncodedFrame};
use openfilter_core::frame::Frame;
use openfilter_core::{Error, Result};

use crate::wire::{self, ControlMessage, WireMessage};

/// Tuning knobs for one producer endpoint
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Outbox depth per non-ephemeral consumer
    pub outbox_depth: usize,
    /// Heartbeat period
    pub heartbeat_interval: Duration,
    /// Consecutive missed pongs before a slot is closed
    pub max_missed_pongs: u32,
    /// Silence window after `hello` before a connection is treated as
    /// doubly ephemeral
    pub subscribe_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        ProducerConfig {
            outbox_depth: 32,
            heartbeat_interval: Duration::from_secs(1),
            max_missed_pongs: 5,
            subscribe_timeout: Duration::from_secs(2),
        }
    }
}

/// A consumer's topic selection
#[derive(Debug, Clone)]
pub struct TopicSub {
    all: bool,
    topics: HashSet<String>,
}

impl TopicSub {
    /// Build from a subscribe list; `*` selects everything
    pub fn new<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut all = false;
        let mut set = HashSet::new();
        for t in topics {
            if t.as_ref() == "*" {
                all = true;
            } else {
                set.insert(t.as_ref().to_string());
            }
        }
        TopicSub { all, topics: set }
    }

    /// Whether a topic is selected
    pub fn matches(&self, topic: &str) -> bool {
        self.all || self.topics.contains(topic)
    }
}

enum OutMsg {
    Frame(Arc<EncodedFrame>),
    Eos(String),
}

/// 1-deep drop-oldest outbox for ephemeral consumers
struct LatestSlot {
    cell: Mutex<Option<OutMsg>>,
    notify: Notify,
}

impl LatestSlot {
    fn new() -> Self {
        LatestSlot {
            cell: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    fn replace(&self, msg: OutMsg) {
        *self.cell.lock() = Some(msg);
        self.notify.notify_one();
    }

    fn take(&self) -> Option<OutMsg> {
        self.cell.lock().take()
    }
}

enum Outbox {
    Bounded(mpsc::Sender<OutMsg>),
    Latest(Arc<LatestSlot>),
}

/// Heartbeat and liveness state shared between a slot's tasks
struct SlotShared {
    gone: AtomicBool,
    missed_pongs: AtomicU32,
    frames_sent: AtomicU64,
}

struct Slot {
    peer: String,
    topics: Mutex<TopicSub>,
    /// Doubly-ephemeral consumers are invisible: no handshake, no
    /// heartbeat accounting, excluded from `consumer_count`
    visible: bool,
    outbox: Outbox,
    shared: Arc<SlotShared>,
}

struct Inner {
    id: String,
    run_id: String,
    cfg: ProducerConfig,
    local_addr: SocketAddr,
    slots: DashMap<u64, Arc<Slot>>,
    next_slot: AtomicU64,
    topics: Mutex<BTreeSet<String>>,
    shutdown: watch::Sender<bool>,
}

/// Bound publish endpoint
#[derive(Clone)]
pub struct Producer {
    inner: Arc<Inner>,
}

impl Producer {
    /// Bind `host:port` and start accepting consumers.
    ///
    /// Port 0 binds an OS-assigned port; see [`Producer::local_addr`].
    pub async fn bind(
        host: &str,
        port: u16,
        id: impl Into<String>,
        run_id: impl Into<String>,
        cfg: ProducerConfig,
    ) -> Result<Producer> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            id: id.into(),
            run_id: run_id.into(),
            cfg,
            local_addr,
            slots: DashMap::new(),
            next_slot: AtomicU64::new(0),
            topics: Mutex::new(BTreeSet::new()),
            shutdown,
        });
        tokio::spawn(accept_loop(inner.clone(), listener, shutdown_rx));
        tracing::debug!(producer = %inner.id, addr = %local_addr, "producer bound");
        Ok(Producer { inner })
    }

    /// The bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Visible (handshaken) consumers currently connected
    pub fn consumer_count(&self) -> usize {
        self.inner.slots.iter().filter(|s| s.visible).count()
    }

    /// Publish one frame to every subscribed consumer.
    ///
    /// Blocks while any non-ephemeral consumer's outbox is full. Peers
    /// that vanished mid-send are recycled without failing the publish.
    pub async fn publish(&self, frame: Frame) -> Result<()> {
        let topic = frame.topic.clone();
        self.inner.topics.lock().insert(topic.clone());
        let encoded = Arc::new(codec::encode(frame)?);
        self.fan_out(&topic, OutMsgKind::Frame(encoded)).await;
        Ok(())
    }

    /// Announce that a topic will not receive further frames
    pub async fn send_eos(&self, topic: &str) {
        self.fan_out(topic, OutMsgKind::Eos).await;
    }

    /// Announce end-of-stream on every topic published so far
    pub async fn send_eos_all(&self) {
        let topics: Vec<String> = self.inner.topics.lock().iter().cloned().collect();
        for topic in topics {
            self.send_eos(&topic).await;
        }
    }

    async fn fan_out(&self, topic: &str, msg: OutMsgKind) {
        // snapshot the slot list so a publish never holds the map open
        // across an await
        let slots: Vec<(u64, Arc<Slot>)> = self
            .inner
            .slots
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        for (slot_id, slot) in slots {
            if !slot.topics.lock().matches(topic) {
                continue;
            }
            let out = msg.materialize(topic);
            match &slot.outbox {
                Outbox::Bounded(tx) => {
                    if tx.send(out).await.is_err() {
                        let err = Error::transport_peer(
                            "peer-gone",
                            slot.peer.clone(),
                            "outbox closed mid-publish",
                        );
                        tracing::warn!(producer = %self.inner.id, %err, "recycling consumer slot");
                        self.inner.slots.remove(&slot_id);
                    }
                }
                Outbox::Latest(latest) => latest.replace(out),
            }
        }
    }

    /// Wait until every bounded outbox is drained, up to `timeout`.
    ///
    /// Used on graceful shutdown so in-flight frames reach consumers.
    pub async fn flush(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let drained = self.inner.slots.iter().all(|slot| match &slot.outbox {
                Outbox::Bounded(tx) => tx.capacity() == tx.max_capacity(),
                Outbox::Latest(_) => true,
            });
            if drained || tokio::time::Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop accepting and disconnect every consumer
    pub fn close(&self) {
        let _ = self.inner.shutdown.send(true);
        self.inner.slots.clear();
    }

    /// Frames written to consumers so far, summed over live slots
    pub fn frames_sent(&self) -> u64 {
        self.inner
            .slots
            .iter()
            .map(|s| s.shared.frames_sent.load(Ordering::Relaxed))
            .sum()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

enum OutMsgKind {
    Frame(Arc<EncodedFrame>),
    Eos,
}

impl OutMsgKind {
    fn materialize(&self, topic: &str) -> OutMsg {
        match self {
            OutMsgKind::Frame(f) => OutMsg::Frame(f.clone()),
            OutMsgKind::Eos => OutMsg::Eos(topic.to_string()),
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(serve_consumer(inner.clone(), stream, peer));
                }
                Err(e) => {
                    tracing::warn!(producer = %inner.id, error = %e, "accept failed");
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn serve_consumer(inner: Arc<Inner>, stream: TcpStream, peer: SocketAddr) {
    let (mut reader, mut writer) = stream.into_split();

    let hello = ControlMessage::Hello {
        producer_id: inner.id.clone(),
        run_id: inner.run_id.clone(),
        topics_available: inner.topics.lock().iter().cloned().collect(),
    };
    if let Err(e) = wire::write_control(&mut writer, &hello).await {
        tracing::debug!(producer = %inner.id, %peer, error = %e, "hello failed");
        return;
    }

    // a consumer that stays silent is doubly ephemeral: serve it on a
    // latest-frame slot and keep no flow state for it
    let subscribe =
        tokio::time::timeout(inner.cfg.subscribe_timeout, wire::read_message(&mut reader)).await;
    let (topics, ephemeral, visible) = match subscribe {
        Ok(Ok(WireMessage::Control(ControlMessage::Subscribe { topics, ephemeral }))) => {
            (TopicSub::new(topics), ephemeral, true)
        }
        Ok(Ok(_)) | Ok(Err(_)) => {
            let err = Error::transport_peer(
                "handshake-failed",
                peer.to_string(),
                "expected subscribe after hello",
            );
            tracing::warn!(producer = %inner.id, %err, "closing connection");
            return;
        }
        Err(_elapsed) => (TopicSub::new(["*"]), true, false),
    };

    let shared = Arc::new(SlotShared {
        gone: AtomicBool::new(false),
        missed_pongs: AtomicU32::new(0),
        frames_sent: AtomicU64::new(0),
    });
    let (outbox, rx) = if ephemeral {
        (Outbox::Latest(Arc::new(LatestSlot::new())), None)
    } else {
        let (tx, rx) = mpsc::channel(inner.cfg.outbox_depth);
        (Outbox::Bounded(tx), Some(rx))
    };
    let latest = match &outbox {
        Outbox::Latest(l) => Some(l.clone()),
        Outbox::Bounded(_) => None,
    };

    let slot = Arc::new(Slot {
        peer: peer.to_string(),
        topics: Mutex::new(topics),
        visible,
        outbox,
        shared: shared.clone(),
    });
    let slot_id = inner.next_slot.fetch_add(1, Ordering::Relaxed);
    inner.slots.insert(slot_id, slot.clone());
    tracing::debug!(
        producer = %inner.id,
        %peer,
        ephemeral,
        visible,
        "consumer joined"
    );

    let read_task = tokio::spawn(slot_reader(inner.clone(), slot.clone(), reader));
    slot_writer(inner.clone(), slot.clone(), rx, latest, writer).await;

    shared.gone.store(true, Ordering::Relaxed);
    read_task.abort();
    inner.slots.remove(&slot_id);
    tracing::debug!(producer = %inner.id, %peer, "consumer slot closed");
}

/// Consume pongs and resubscribes until the peer goes away
async fn slot_reader(inner: Arc<Inner>, slot: Arc<Slot>, mut reader: OwnedReadHalf) {
    loop {
        match wire::read_message(&mut reader).await {
            Ok(WireMessage::Control(ControlMessage::Pong { .. })) => {
                slot.shared.missed_pongs.store(0, Ordering::Relaxed);
            }
            Ok(WireMessage::Control(ControlMessage::Subscribe { topics, .. })) => {
                *slot.topics.lock() = TopicSub::new(topics);
            }
            Ok(_) => {}
            Err(e) => {
                if !slot.shared.gone.swap(true, Ordering::Relaxed) {
                    tracing::debug!(
                        producer = %inner.id,
                        peer = %slot.peer,
                        error = %e,
                        "consumer read side closed"
                    );
                }
                return;
            }
        }
    }
}

/// Drain the outbox and drive heartbeats for one consumer
async fn slot_writer(
    inner: Arc<Inner>,
    slot: Arc<Slot>,
    mut bounded: Option<mpsc::Receiver<OutMsg>>,
    latest: Option<Arc<LatestSlot>>,
    mut writer: OwnedWriteHalf,
) {
    let mut heartbeat = tokio::time::interval(inner.cfg.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut shutdown = inner.shutdown.subscribe();

    enum WriterEvent {
        Msg(OutMsg),
        Tick,
        Done,
    }

    loop {
        if slot.shared.gone.load(Ordering::Relaxed) {
            return;
        }
        let event = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    WriterEvent::Done
                } else {
                    WriterEvent::Tick
                }
            }
            _ = heartbeat.tick() => {
                // invisible consumers never handshook; they get no pings
                // and no liveness accounting
                if slot.visible {
                    let missed = slot.shared.missed_pongs.fetch_add(1, Ordering::Relaxed);
                    if missed >= inner.cfg.max_missed_pongs {
                        let err = Error::transport_peer(
                            "peer-gone",
                            slot.peer.clone(),
                            format!("{missed} consecutive missed pongs"),
                        );
                        tracing::warn!(producer = %inner.id, %err, "evicting consumer");
                        return;
                    }
                    let ping = ControlMessage::Ping { ts: wire::now_ms() };
                    if wire::write_control(&mut writer, &ping).await.is_err() {
                        return;
                    }
                }
                WriterEvent::Tick
            }
            received = recv_outbox(&mut bounded, &latest) => match received {
                Some(msg) => WriterEvent::Msg(msg),
                // slot dropped from the registry: outbox is gone
                None => WriterEvent::Done,
            },
        };
        let msg = match event {
            WriterEvent::Msg(msg) => msg,
            WriterEvent::Tick => continue,
            WriterEvent::Done => return,
        };
        let result = match &msg {
            OutMsg::Frame(frame) => wire::write_frame(&mut writer, frame).await,
            OutMsg::Eos(topic) => {
                wire::write_control(&mut writer, &ControlMessage::Eos { topic: topic.clone() })
                    .await
            }
        };
        match result {
            Ok(()) => {
                if matches!(msg, OutMsg::Frame(_)) {
                    slot.shared.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                tracing::debug!(
                    producer = %inner.id,
                    peer = %slot.peer,
                    error = %e,
                    "write failed, recycling slot"
                );
                return;
            }
        }
    }
}

async fn recv_outbox(
    bounded: &mut Option<mpsc::Receiver<OutMsg>>,
    latest: &Option<Arc<LatestSlot>>,
) -> Option<OutMsg> {
    match (bounded, latest) {
        (Some(rx), _) => rx.recv().await,
        (None, Some(slot)) => loop {
            if let Some(msg) = slot.take() {
                return Some(msg);
            }
            slot.notify.notified().await;
        },
        (None, None) => std::future::pending().await,
    }
}
