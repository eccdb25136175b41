//! Process-wide run identity
//!
//! Every filter of one multi-filter launch shares a single `run_id` so
//! lineage events and logs correlate. The launcher generates it (or
//! honors `RUN_ID`) and threads it into each worker; it also exports the
//! variable so nested launches stay correlated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `RUN_ID` — overrides the auto-generated run id
pub const ENV_RUN_ID: &str = "RUN_ID";

/// Identity shared by all filters of one launcher invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// UUID stable across every filter in the launch
    pub run_id: String,
    /// Producing application name
    pub producer: String,
    /// Launch wall time
    pub started_at: DateTime<Utc>,
}

impl Run {
    /// Fresh run with a generated id
    pub fn new(producer: impl Into<String>) -> Self {
        Run {
            run_id: Uuid::new_v4().to_string(),
            producer: producer.into(),
            started_at: Utc::now(),
        }
    }

    /// Run honoring the `RUN_ID` override
    pub fn from_env(producer: impl Into<String>) -> Self {
        let mut run = Run::new(producer);
        if let Ok(id) = std::env::var(ENV_RUN_ID) {
            if !id.trim().is_empty() {
                run.run_id = id.trim().to_string();
            }
        }
        run
    }

    /// Export `RUN_ID` so spawned collaborators correlate
    pub fn export_env(&self) {
        std::env::set_var(ENV_RUN_ID, &self.run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_override() {
        std::env::set_var(ENV_RUN_ID, "run-fixed");
        let run = Run::from_env("test");
        std::env::remove_var(ENV_RUN_ID);
        assert_eq!(run.run_id, "run-fixed");
        let run = Run::from_env("test");
        assert_ne!(run.run_id, "run-fixed");
        assert_eq!(run.run_id.len(), 36);
    }
}
