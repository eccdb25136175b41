//! OpenFilter wire transport - TCP publish/subscribe
//!
//! Every output endpoint binds a [`Producer`]; every source endpoint
//! connects a [`Consumer`]. The wire carries two-part frame messages
//! (JSON header + raw image bytes) and a tiny control plane (`hello`,
//! `subscribe`, `ping`/`pong`, `eos`).
//!
//! Guarantees, per `(producer, topic)`:
//! - non-ephemeral subscribers observe frames in publication order, with
//!   loss only across reconnects
//! - ephemeral subscribers may drop arbitrarily many frames but never
//!   observe reordering
//!
//! Backpressure is per consumer: a full non-ephemeral outbox blocks the
//! producer; ephemeral consumers ride a 1-deep drop-oldest slot.

#![warn(clippy::all)]

pub mod backoff;
pub mod consumer;
pub mod producer;
pub mod wire;

pub use backoff::Backoff;
pub use consumer::{Consumer, ConsumerConfig, ConsumerEvent};
pub use producer::{Producer, ProducerConfig, TopicSub};
pub use wire::{ControlMessage, WireMessage};
