//! Process-wide metric allowlist
//!
//! Every export is gated by a set of glob patterns. The default is
//! lock-down: with no patterns configured, nothing leaves the process.
//! Blocked names are logged once each.

use std::collections::HashSet;

use glob::Pattern;
use parking_lot::Mutex;

use crate::{Error, Result};

/// `SAFE_METRICS` — comma-separated allowlist patterns
pub const ENV_SAFE_METRICS: &str = "SAFE_METRICS";

/// `SAFE_METRICS_FILE` — YAML document with allowlist patterns
pub const ENV_SAFE_METRICS_FILE: &str = "SAFE_METRICS_FILE";

/// Glob-pattern allowlist with one-per-name block warnings
pub struct MetricAllowlist {
    patterns: Vec<Pattern>,
    warned: Mutex<HashSet<String>>,
}

impl MetricAllowlist {
    /// Build from pattern strings. Invalid globs fail.
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut compiled = Vec::new();
        for raw in patterns {
            let raw = raw.as_ref().trim();
            if raw.is_empty() {
                continue;
            }
            let pattern = Pattern::new(raw).map_err(|e| {
                Error::config_field(ENV_SAFE_METRICS, format!("bad pattern {raw:?}: {e}"))
            })?;
            compiled.push(pattern);
        }
        Ok(MetricAllowlist {
            patterns: compiled,
            warned: Mutex::new(HashSet::new()),
        })
    }

    /// Empty allowlist: everything is blocked
    pub fn deny_all() -> Self {
        MetricAllowlist {
            patterns: Vec::new(),
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// Build from `SAFE_METRICS` and `SAFE_METRICS_FILE`.
    ///
    /// Both sources contribute patterns; either may be absent. The file
    /// is YAML: a plain list of patterns, or a mapping with a `metrics`
    /// list.
    pub fn from_env() -> Result<Self> {
        let mut patterns: Vec<String> = Vec::new();
        if let Ok(raw) = std::env::var(ENV_SAFE_METRICS) {
            patterns.extend(raw.split(',').map(str::trim).map(str::to_string));
        }
        if let Ok(path) = std::env::var(ENV_SAFE_METRICS_FILE) {
            let raw = std::fs::read_to_string(&path).map_err(|e| {
                Error::config_field(ENV_SAFE_METRICS_FILE, format!("{path}: {e}"))
            })?;
            patterns.extend(parse_allowlist_file(&raw)?);
        }
        Self::new(patterns)
    }

    /// Number of compiled patterns
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether no patterns are configured (lock-down default)
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether a metric name matches the allowlist
    pub fn allows(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }

    /// Gate one export, warning once per distinct blocked name
    pub fn check(&self, name: &str) -> bool {
        if self.allows(name) {
            return true;
        }
        let mut warned = self.warned.lock();
        if warned.insert(name.to_string()) {
            tracing::warn!(metric = %name, "metric blocked by allowlist");
        }
        false
    }

    /// Distinct names blocked so far
    pub fn blocked_names(&self) -> Vec<String> {
        let warned = self.warned.lock();
        let mut names: Vec<String> = warned.iter().cloned().collect();
        names.sort();
        names
    }
}

fn parse_allowlist_file(raw: &str) -> Result<Vec<String>> {
    let doc: serde_yaml::Value = serde_yaml::from_str(raw)
        .map_err(|e| Error::config_field(ENV_SAFE_METRICS_FILE, e.to_string()))?;
    let seq = match &doc {
        serde_yaml::Value::Sequence(seq) => seq.clone(),
        serde_yaml::Value::Mapping(map) => match map.get("metrics") {
            Some(serde_yaml::Value::Sequence(seq)) => seq.clone(),
            _ => {
                return Err(Error::config_field(
                    ENV_SAFE_METRICS_FILE,
                    "expected a list or a mapping with a `metrics` list",
                ))
            }
        },
        serde_yaml::Value::Null => Vec::new(),
        _ => {
            return Err(Error::config_field(
                ENV_SAFE_METRICS_FILE,
                "expected a list or a mapping with a `metrics` list",
            ))
        }
    };
    seq.into_iter()
        .map(|v| match v {
            serde_yaml::Value::String(s) => Ok(s),
            other => Err(Error::config_field(
                ENV_SAFE_METRICS_FILE,
                format!("expected string pattern, got {other:?}"),
            )),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_blocks_everything() {
        let list = MetricAllowlist::deny_all();
        assert!(!list.allows("fps"));
        assert!(!list.check("fps"));
    }

    #[test]
    fn test_glob_matching() {
        let list = MetricAllowlist::new(["foo_*", "fps"]).unwrap();
        assert!(list.allows("foo_counter"));
        assert!(list.allows("fps"));
        assert!(!list.allows("bar_histogram"));
        assert!(!list.allows("fps_raw"));
    }

    #[test]
    fn test_warn_once_per_name() {
        let list = MetricAllowlist::new(["foo_*"]).unwrap();
        assert!(!list.check("bar"));
        assert!(!list.check("bar"));
        assert!(!list.check("baz"));
        assert_eq!(list.blocked_names(), vec!["bar".to_string(), "baz".to_string()]);
    }

    #[test]
    fn test_file_formats() {
        let plain = parse_allowlist_file("- foo_*\n- bar\n").unwrap();
        assert_eq!(plain, vec!["foo_*", "bar"]);
        let mapped = parse_allowlist_file("metrics:\n  - fps\n").unwrap();
        assert_eq!(mapped, vec!["fps"]);
        assert!(parse_allowlist_file("metrics: 3\n").is_err());
    }

    #[test]
    fn test_from_file_via_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "- sys_*").unwrap();
        std::env::set_var(ENV_SAFE_METRICS_FILE, file.path());
        std::env::remove_var(ENV_SAFE_METRICS);
        let list = MetricAllowlist::from_env().unwrap();
        std::env::remove_var(ENV_SAFE_METRICS_FILE);
        assert!(list.allows("sys_cpu"));
        assert!(!list.allows("cpu"));
    }

    #[test]
    fn test_bad_pattern_rejected() {
        assert!(MetricAllowlist::new(["[unclosed"]).is_err());
    }
}
