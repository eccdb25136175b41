//! OpenFilter runtime - synchronizer, supervisor, launcher, telemetry
//!
//! This crate turns the core types and the wire transport into a running
//! pipeline:
//!
//! - [`filter`]: the [`Filter`](filter::Filter) capability interface
//!   user code implements, plus [`Tick`](filter::Tick) and the context
//! - [`sync`]: the multi-source tick synchronizer (loose, strict and
//!   by-id assembly)
//! - [`router`]: output topic rewriting and publish fan-out
//! - [`supervisor`]: the per-filter lifecycle state machine
//! - [`launcher`]: [`run_multi`](launcher::run_multi), the supervised
//!   group with the propagate/obey/stop exit protocol
//! - [`telemetry`]: metric export driver and lineage emission
//! - [`plugins`]: hooks for external endpoint schemes
//!
//! # Example
//!
//! ```no_run
//! use openfilter_runtime::filter::{Filter, FilterContext, Tick};
//! use openfilter_runtime::launcher::{run_multi, FilterSpec, LauncherOptions};
//! use openfilter_core::frame::Frame;
//! use openfilter_core::Result;
//! use serde_json::{json, Map};
//!
//! struct Passthrough;
//!
//! impl Filter for Passthrough {
//!     fn process(&mut self, _ctx: &FilterContext, tick: Tick) -> Result<Vec<Frame>> {
//!         Ok(tick.into_frames().collect())
//!     }
//! }
//!
//! let config: Map<String, serde_json::Value> = json!({
//!     "sources": "tcp://localhost:5550;main",
//!     "outputs": "tcp://*:5552;main",
//! })
//! .as_object()
//! .unwrap()
//! .clone();
//! let status = run_multi(
//!     vec![FilterSpec::new("Passthrough", config, || Box::new(Passthrough))],
//!     LauncherOptions::default(),
//! );
//! std::process::exit(status.exit_code());
//! ```

#![warn(clippy::all)]

pub mod filter;
pub mod launcher;
pub mod plugins;
pub mod router;
pub mod sampler;
pub mod supervisor;
pub mod sync;
pub mod telemetry;

pub use filter::{Filter, FilterContext, FilterState, Tick};
pub use launcher::{run_multi, FilterSpec, LauncherOptions, PipelineStatus};
pub use supervisor::{run_filter, FilterReport, WorkerControl};
