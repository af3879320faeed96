//! Engine configuration.
//!
//! All tunables have defaults matching the reference deployment; a TOML file
//! may override any subset of them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Tunables for a `WorkflowEngine` instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cap on concurrently running executions.
    pub max_concurrent_workflows: usize,
    /// Whether failed executions get one automatic recovery restart.
    pub enable_recovery: bool,
    /// Workflow-level timeout in seconds (default 24h).
    pub workflow_timeout_secs: u64,
    /// Step timeout applied when a step declares none (default 5m).
    pub default_step_timeout_secs: u64,
    /// Timeout-monitor sweep interval in seconds.
    pub monitor_interval_secs: u64,
    /// Metrics recomputation interval in seconds.
    pub metrics_interval_secs: u64,
    /// Garbage-collection sweep interval in seconds.
    pub gc_interval_secs: u64,
    /// Retention window for terminal executions in seconds (default 7d).
    pub retention_secs: u64,
    /// Scheduling-loop poll interval in milliseconds.
    pub scheduler_poll_ms: u64,
    /// Dependency-readiness poll interval in milliseconds.
    pub dependency_poll_ms: u64,
    /// Job-status poll interval in milliseconds (reference 1s).
    pub job_poll_ms: u64,
    /// Broadcast event bus capacity.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 10,
            enable_recovery: true,
            workflow_timeout_secs: 86_400,
            default_step_timeout_secs: 300,
            monitor_interval_secs: 60,
            metrics_interval_secs: 30,
            gc_interval_secs: 3_600,
            retention_secs: 604_800,
            scheduler_poll_ms: 100,
            dependency_poll_ms: 200,
            job_poll_ms: 1_000,
            event_capacity: 1_024,
        }
    }
}

impl EngineConfig {
    /// Parse a config from TOML; unset keys fall back to defaults.
    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow_timeout_secs)
    }

    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }

    pub fn scheduler_poll(&self) -> Duration {
        Duration::from_millis(self.scheduler_poll_ms)
    }

    pub fn dependency_poll(&self) -> Duration {
        Duration::from_millis(self.dependency_poll_ms)
    }

    pub fn job_poll(&self) -> Duration {
        Duration::from_millis(self.job_poll_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_workflows, 10);
        assert!(config.enable_recovery);
        assert_eq!(config.workflow_timeout_secs, 86_400);
        assert_eq!(config.retention_secs, 604_800);
        assert_eq!(config.job_poll_ms, 1_000);
    }

    #[test]
    fn partial_toml_overrides_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            max_concurrent_workflows = 3
            enable_recovery = false
            "#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_workflows, 3);
        assert!(!config.enable_recovery);
        // Untouched keys keep their defaults
        assert_eq!(config.monitor_interval_secs, 60);
    }

    #[test]
    fn empty_toml_is_all_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        let defaults = EngineConfig::default();
        assert_eq!(config.max_concurrent_workflows, defaults.max_concurrent_workflows);
        assert_eq!(config.workflow_timeout_secs, defaults.workflow_timeout_secs);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(EngineConfig::from_toml_str("max_concurrent_workflows = \"lots\"").is_err());
    }
}
