//! Engine lifecycle events published on the event bus.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted by the workflow engine as executions progress.
///
/// Published on a broadcast bus; consumers (operator UIs, audit sinks) may
/// come and go without affecting execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// An execution was admitted and queued.
    ExecutionEnqueued {
        execution_id: Uuid,
        workflow_id: Uuid,
    },
    /// The scheduling loop dequeued the execution and began driving it.
    ExecutionStarted {
        execution_id: Uuid,
        workflow_name: String,
    },
    /// A step attempt began.
    StepStarted {
        execution_id: Uuid,
        step_id: String,
        attempt: u32,
    },
    /// A step reached Completed.
    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },
    /// A step attempt failed; `will_retry` says whether another attempt
    /// follows.
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        error: String,
        will_retry: bool,
    },
    /// A conditional step's predicates were unmet.
    StepSkipped {
        execution_id: Uuid,
        step_id: String,
    },
    /// The execution completed successfully.
    ExecutionCompleted {
        execution_id: Uuid,
        duration_ms: u64,
        steps_completed: u32,
    },
    /// The execution failed terminally.
    ExecutionFailed {
        execution_id: Uuid,
        error: String,
    },
    /// The execution was cancelled.
    ExecutionCancelled { execution_id: Uuid },
    /// The recovery loop re-enqueued a failed execution.
    ExecutionRecovered {
        execution_id: Uuid,
        recovery_attempt: u32,
    },
    /// The timeout monitor force-cancelled a long-running execution.
    ExecutionTimedOut { execution_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serde_tagged() {
        let event = WorkflowEvent::StepFailed {
            execution_id: Uuid::now_v7(),
            step_id: "analyze".to_string(),
            error: "job failed".to_string(),
            will_retry: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"step_failed\""));
        assert!(json.contains("\"will_retry\":true"));
        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
