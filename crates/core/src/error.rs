//! Error types for the OpenFilter core

use thiserror::Error;

/// Result type alias for OpenFilter operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by every runtime component.
///
/// Each variant carries a machine-readable `kind` tag alongside the human
/// message so callers can branch on the failure class without string
/// matching. [`Error::recoverable`] encodes the propagation policy: a
/// recoverable error is logged and processing continues, a non-recoverable
/// one drains the filter.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed endpoint DSL, bad option value, unknown strict key
    #[error("config error ({kind}): {message}")]
    Config {
        /// Failure class, e.g. "malformed-endpoint"
        kind: &'static str,
        /// Human-readable description
        message: String,
        /// Offending config field, when known
        field: Option<String>,
        /// Byte position in the parsed DSL string, when known
        pos: Option<usize>,
    },

    /// Frame construction or wire codec failure
    #[error("frame error ({kind}): {message}")]
    Frame {
        /// Failure class, e.g. "shape-mismatch", "header-too-large"
        kind: &'static str,
        /// Human-readable description
        message: String,
    },

    /// Wire transport fault on a single peer
    #[error("transport error ({kind}): {message}")]
    Transport {
        /// Failure class: "peer-gone", "handshake-failed",
        /// "header-too-large" or "wire-decode"
        kind: &'static str,
        /// Human-readable description
        message: String,
        /// Peer address or id, when known
        peer: Option<String>,
    },

    /// Tick assembly fault (deadline exceeded, inconsistent alignment)
    #[error("sync error ({kind}): {message}")]
    Sync {
        /// Failure class, e.g. "tick-deadline"
        kind: &'static str,
        /// Human-readable description
        message: String,
    },

    /// Error or panic escaping the user `process` hook
    #[error("user process error: {message}")]
    UserProcess {
        /// Rendered cause
        message: String,
    },

    /// Setup/shutdown failure or drain-deadline expiry
    #[error("lifecycle error ({kind}): {message}")]
    Lifecycle {
        /// Failure class, e.g. "setup-failed", "drain-deadline"
        kind: &'static str,
        /// Human-readable description
        message: String,
    },

    /// Telemetry export or lineage emission failure
    #[error("telemetry error ({kind}): {message}")]
    Telemetry {
        /// Failure class, e.g. "export-failed"
        kind: &'static str,
        /// Human-readable description
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Config error with a kind tag
    pub fn config(kind: &'static str, message: impl Into<String>) -> Self {
        Error::Config {
            kind,
            message: message.into(),
            field: None,
            pos: None,
        }
    }

    /// Config error attributed to a specific field
    pub fn config_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Config {
            kind: "invalid-field",
            message: reason.into(),
            field: Some(field.into()),
            pos: None,
        }
    }

    /// Endpoint DSL syntax error at a byte position
    pub fn malformed_endpoint(pos: usize, message: impl Into<String>) -> Self {
        Error::Config {
            kind: "malformed-endpoint",
            message: message.into(),
            field: None,
            pos: Some(pos),
        }
    }

    /// Frame error with a kind tag
    pub fn frame(kind: &'static str, message: impl Into<String>) -> Self {
        Error::Frame {
            kind,
            message: message.into(),
        }
    }

    /// Transport error with a kind tag
    pub fn transport(kind: &'static str, message: impl Into<String>) -> Self {
        Error::Transport {
            kind,
            message: message.into(),
            peer: None,
        }
    }

    /// Transport error attributed to a peer
    pub fn transport_peer(
        kind: &'static str,
        peer: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Transport {
            kind,
            message: message.into(),
            peer: Some(peer.into()),
        }
    }

    /// Sync error with a kind tag
    pub fn sync(kind: &'static str, message: impl Into<String>) -> Self {
        Error::Sync {
            kind,
            message: message.into(),
        }
    }

    /// Error escaping the user `process` hook
    pub fn user_process(message: impl Into<String>) -> Self {
        Error::UserProcess {
            message: message.into(),
        }
    }

    /// Lifecycle error with a kind tag
    pub fn lifecycle(kind: &'static str, message: impl Into<String>) -> Self {
        Error::Lifecycle {
            kind,
            message: message.into(),
        }
    }

    /// Telemetry error with a kind tag
    pub fn telemetry(kind: &'static str, message: impl Into<String>) -> Self {
        Error::Telemetry {
            kind,
            message: message.into(),
        }
    }

    /// Kind tag, when the variant carries one
    pub fn kind(&self) -> Option<&'static str> {
        match self {
            Error::Config { kind, .. }
            | Error::Frame { kind, .. }
            | Error::Transport { kind, .. }
            | Error::Sync { kind, .. }
            | Error::Lifecycle { kind, .. }
            | Error::Telemetry { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Whether processing may continue after logging this error.
    ///
    /// Frame, transport, sync, telemetry and individual user-process
    /// failures are recoverable; config, lifecycle, I/O and
    /// serialization failures are fatal for the filter.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            Error::Frame { .. }
                | Error::Transport { .. }
                | Error::Sync { .. }
                | Error::UserProcess { .. }
                | Error::Telemetry { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        let err = Error::malformed_endpoint(7, "unexpected ';'");
        assert_eq!(err.kind(), Some("malformed-endpoint"));
        match err {
            Error::Config { pos, .. } => assert_eq!(pos, Some(7)),
            _ => panic!("expected config error"),
        }
    }

    #[test]
    fn test_recoverable_policy() {
        assert!(Error::frame("shape-mismatch", "x").recoverable());
        assert!(Error::transport("peer-gone", "x").recoverable());
        assert!(Error::sync("tick-deadline", "x").recoverable());
        assert!(Error::telemetry("export-failed", "x").recoverable());
        assert!(Error::user_process("boom").recoverable());
        assert!(!Error::config("malformed-endpoint", "x").recoverable());
        assert!(!Error::lifecycle("setup-failed", "x").recoverable());
    }
}
