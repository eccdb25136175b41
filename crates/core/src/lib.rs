//! OpenFilter core - frame model, endpoint DSL, config and metrics
//!
//! This crate holds the transport-agnostic building blocks of an
//! OpenFilter pipeline:
//!
//! - [`frame`]: the [`Frame`](frame::Frame) data model and its two-part
//!   wire codec (JSON header + raw image bytes, zero-copy decode)
//! - [`endpoint`]: the source/output DSL parser (topic remaps,
//!   ephemerality markers, per-endpoint options)
//! - [`config`]: typed filter configuration with environment overlay
//! - [`metrics`]: declarative metric specs, the per-filter registry and
//!   the process-wide export allowlist
//! - [`image`]: pure image transforms shared by many filters
//! - [`run`]: the run identity correlating all filters of one launch
//!
//! The wire layer lives in `openfilter-transport`; the synchronizer,
//! supervisor and launcher live in `openfilter-runtime`.

#![warn(clippy::all)]

pub mod config;
pub mod endpoint;
pub mod frame;
pub mod image;
pub mod metrics;
pub mod run;

mod error;
pub use error::{Error, Result};

pub use frame::{Frame, Image, PixelFormat};
pub use run::Run;

/// `LOG_LEVEL` — process log level (`debug|info|warn|error`)
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

/// Initialize logging for an OpenFilter process.
///
/// `LOG_LEVEL` sets the base level; `RUST_LOG` still works for
/// per-component directives and wins when set. Safe to call more than
/// once.
pub fn init() {
    use tracing_subscriber::EnvFilter;

    let filter = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| std::env::var(ENV_LOG_LEVEL).ok())
        .unwrap_or_else(|| "info".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .try_init();
}
