//! Wire types of the job-service boundary.
//!
//! The engine never runs a step's payload itself: it builds a `Job` from a
//! `WorkflowStep`, submits it to the configured job service, and polls a
//! `JobSnapshot` until the job reaches a terminal state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::WorkflowStep;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of work submitted to the external job service.
///
/// Carries correlation metadata (`execution_id`, `step_id`) so results can be
/// routed back into the right execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// UUIDv7 job id, assigned by the engine at submission time.
    pub id: Uuid,
    /// Opaque job type (the step's `step_type`).
    pub job_type: String,
    /// Scheduling priority hint.
    #[serde(default)]
    pub priority: JobPriority,
    /// Named inputs copied from the step.
    #[serde(default)]
    pub inputs: serde_json::Map<String, Value>,
    /// Advisory resource requirements copied from the step.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub resource_requirements: HashMap<String, f64>,
    /// Execution this job belongs to.
    pub execution_id: Uuid,
    /// Step this job implements.
    pub step_id: String,
}

impl Job {
    /// Build a job from a workflow step, correlated to an execution.
    pub fn from_step(execution_id: Uuid, step: &WorkflowStep) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_type: step.step_type.clone(),
            priority: JobPriority::default(),
            inputs: step.inputs.clone(),
            resource_requirements: step.resource_requirements.clone(),
            execution_id,
            step_id: step.id.clone(),
        }
    }
}

/// Scheduling priority hint for the job service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
}

// ---------------------------------------------------------------------------
// Job status
// ---------------------------------------------------------------------------

/// Lifecycle status reported by the job service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states stop the engine's polling loop.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Point-in-time view of a job, returned by the job service on each poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// Current job status.
    pub status: JobStatus,
    /// Output payload, populated when the job completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    /// Failure reason, populated when the job failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::DependencyKind;
    use serde_json::json;

    #[test]
    fn job_from_step_copies_correlation_and_payload() {
        let mut inputs = serde_json::Map::new();
        inputs.insert("source".to_string(), json!("court-records"));
        let step = WorkflowStep {
            id: "collect".to_string(),
            name: "Collect Records".to_string(),
            step_type: "data_collection".to_string(),
            inputs,
            resource_requirements: HashMap::from([("cpu".to_string(), 2.0)]),
            timeout_secs: Some(60),
            retry: None,
            depends_on: vec![],
            dependency_kind: DependencyKind::Sequential,
            conditions: vec![],
            metadata: HashMap::new(),
        };
        let execution_id = Uuid::now_v7();

        let job = Job::from_step(execution_id, &step);
        assert_eq!(job.execution_id, execution_id);
        assert_eq!(job.step_id, "collect");
        assert_eq!(job.job_type, "data_collection");
        assert_eq!(job.priority, JobPriority::Normal);
        assert_eq!(job.inputs["source"], json!("court-records"));
        assert_eq!(job.resource_requirements["cpu"], 2.0);
    }

    #[test]
    fn job_status_terminal_classification() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn job_snapshot_json_roundtrip() {
        let snapshot = JobSnapshot {
            status: JobStatus::Failed,
            outputs: None,
            error: Some("backend unreachable".to_string()),
        };
        let json_str = serde_json::to_string(&snapshot).unwrap();
        let parsed: JobSnapshot = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.status, JobStatus::Failed);
        assert_eq!(parsed.error.as_deref(), Some("backend unreachable"));
    }
}
