//! Subscribe side of a source endpoint
//!
//! A [`Consumer`] connects to a producer, completes the
//! `hello`/`subscribe` handshake and turns the wire into a stream of
//! [`ConsumerEvent`]s. Connection loss triggers exponential-backoff
//! reconnection; frames lost while away are simply gone (the wire is
//! lossy by contract, ordering within a topic is not).
//!
//! A doubly-ephemeral consumer skips the `subscribe` reply entirely, so
//! the producer never learns it exists.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use openfilter_core::endpoint::Ephemerality;
use openfilter_core::frame::codec;
use openfilter_core::frame::Frame;
use openfilter_core::{Error, Result};

use crate::backoff::Backoff;
use crate::wire::{self, ControlMessage, WireMessage};

/// Tuning knobs for one consumer connection
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Topics to subscribe; `*` subscribes to everything
    pub topics: Vec<String>,
    /// Flow-control participation
    pub ephemerality: Ephemerality,
    /// Per-attempt connect timeout
    pub connect_timeout: Duration,
    /// Reconnect after connection loss
    pub reconnect: bool,
    /// Inbound event queue depth; a full queue backpressures the socket
    pub queue_depth: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            topics: vec!["*".to_string()],
            ephemerality: Ephemerality::None,
            connect_timeout: Duration::from_secs(5),
            reconnect: true,
            queue_depth: 256,
        }
    }
}

/// What a consumer observes on its connection
#[derive(Debug)]
pub enum ConsumerEvent {
    /// Handshake completed
    Connected {
        /// Peer's filter id
        producer_id: String,
        /// Peer's run id
        run_id: String,
        /// Topics the peer had published when we joined
        topics_available: Vec<String>,
    },
    /// One decoded frame
    Frame(Frame),
    /// A topic will not receive further frames
    Eos {
        /// Ended topic
        topic: String,
    },
    /// Connection lost; reconnection may follow
    Disconnected {
        /// Rendered cause
        reason: String,
    },
}

/// Connected subscribe endpoint
pub struct Consumer {
    events: mpsc::Receiver<ConsumerEvent>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Consumer {
    /// Connect to `addr` (`host:port`) and start the receive loop.
    ///
    /// Connection happens in the background: the first event is either
    /// `Connected` or `Disconnected`.
    pub fn connect(addr: impl Into<String>, cfg: ConsumerConfig) -> Consumer {
        let addr = addr.into();
        let (events_tx, events) = mpsc::channel(cfg.queue_depth.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(addr, cfg, events_tx, shutdown_rx));
        Consumer {
            events,
            shutdown,
            task,
        }
    }

    /// Next event; `None` after [`Consumer::stop`] or a terminal failure
    pub async fn next_event(&mut self) -> Option<ConsumerEvent> {
        self.events.recv().await
    }

    /// Stop receiving and drop the connection
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

async fn run(
    addr: String,
    cfg: ConsumerConfig,
    events: mpsc::Sender<ConsumerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new();
    loop {
        if *shutdown.borrow() {
            return;
        }
        let stream = tokio::select! {
            connected = tokio::time::timeout(cfg.connect_timeout, TcpStream::connect(&addr)) => {
                match connected {
                    Ok(Ok(stream)) => Some(stream),
                    Ok(Err(e)) => {
                        tracing::debug!(%addr, error = %e, "connect failed");
                        None
                    }
                    Err(_) => {
                        tracing::debug!(%addr, "connect timed out");
                        None
                    }
                }
            }
            _ = shutdown.changed() => return,
        };

        if let Some(stream) = stream {
            let _ = stream.set_nodelay(true);
            backoff.reset();
            let reason = match serve(stream, &cfg, &events, &mut shutdown).await {
                Ok(()) => return,
                Err(e) => e.to_string(),
            };
            if events
                .send(ConsumerEvent::Disconnected { reason })
                .await
                .is_err()
            {
                return;
            }
            if !cfg.reconnect {
                return;
            }
        } else if !cfg.reconnect {
            let _ = events
                .send(ConsumerEvent::Disconnected {
                    reason: format!("{addr}: connect failed"),
                })
                .await;
            return;
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// Serve one established connection; `Ok(())` means deliberate shutdown
async fn serve(
    stream: TcpStream,
    cfg: &ConsumerConfig,
    events: &mpsc::Sender<ConsumerEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let hello = tokio::time::timeout(cfg.connect_timeout, wire::read_message(&mut reader))
        .await
        .map_err(|_| Error::transport("handshake-failed", "no hello from producer"))??;
    let (producer_id, run_id, topics_available) = match hello {
        WireMessage::Control(ControlMessage::Hello {
            producer_id,
            run_id,
            topics_available,
        }) => (producer_id, run_id, topics_available),
        _ => {
            return Err(Error::transport(
                "handshake-failed",
                "expected hello from producer",
            ))
        }
    };

    // doubly-ephemeral consumers stay silent: no subscribe, upstream
    // keeps no state for us
    if cfg.ephemerality != Ephemerality::DoublyEphemeral {
        let subscribe = ControlMessage::Subscribe {
            topics: cfg.topics.clone(),
            ephemeral: cfg.ephemerality.is_ephemeral(),
        };
        wire::write_control(&mut writer, &subscribe).await?;
    }

    if events
        .send(ConsumerEvent::Connected {
            producer_id,
            run_id,
            topics_available,
        })
        .await
        .is_err()
    {
        return Ok(());
    }

    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
            message = wire::read_message(&mut reader) => message,
        };
        match message {
            Ok(WireMessage::Frame(encoded)) => {
                match codec::decode(&encoded.header, encoded.image) {
                    Ok(frame) => {
                        if events.send(ConsumerEvent::Frame(frame)).await.is_err() {
                            return Ok(());
                        }
                    }
                    // a bad frame is dropped, the stream continues
                    Err(e) => tracing::warn!(error = %e, "dropping undecodable frame"),
                }
            }
            Ok(WireMessage::Control(ControlMessage::Ping { ts })) => {
                wire::write_control(&mut writer, &ControlMessage::Pong { ts }).await?;
            }
            Ok(WireMessage::Control(ControlMessage::Eos { topic })) => {
                if events.send(ConsumerEvent::Eos { topic }).await.is_err() {
                    return Ok(());
                }
            }
            Ok(WireMessage::Control(_)) => {}
            Err(Error::Io(e)) => {
                return Err(Error::transport_peer(
                    "peer-gone",
                    "producer",
                    e.to_string(),
                ))
            }
            // decode faults are recoverable per-message; resynchronizing
            // a corrupt length-delimited stream is not, so drop the
            // connection and let backoff take over
            Err(e) => return Err(e),
        }
    }
}
