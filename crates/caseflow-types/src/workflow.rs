//! Workflow domain types for Caseflow.
//!
//! Defines the immutable workflow definition (`Workflow`, `WorkflowStep`),
//! the mutable execution tracking types (`WorkflowExecution`,
//! `StepExecutionRecord`, `StepResult`), the closed predicate set used for
//! conditional execution (`StepCondition`), and the process-wide aggregate
//! metrics (`WorkflowMetrics`).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow definition (immutable after creation)
// ---------------------------------------------------------------------------

/// An immutable workflow template: steps, dependency edges, and the
/// execution topology that drives them.
///
/// Parameter substitution happens once, when the workflow is created from a
/// template. After that the definition is never mutated; all run state lives
/// in `WorkflowExecution`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// UUIDv7 assigned at creation.
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Ordered list of steps forming the workflow graph.
    pub steps: Vec<WorkflowStep>,
    /// Which topology strategy drives this workflow.
    pub execution_mode: ExecutionMode,
    /// How this workflow may be started.
    #[serde(default)]
    pub triggers: Vec<TriggerKind>,
    /// Workflow-level timeout in seconds (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// When the workflow was created.
    pub created_at: DateTime<Utc>,
    /// Mode-specific parameters (`max_iterations`, `stop_on_output`,
    /// `branches`) and any custom annotations.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Workflow {
    /// Look up a step by its id.
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Loop-mode iteration bound from `metadata.max_iterations`.
    pub fn max_iterations(&self) -> u64 {
        self.metadata
            .get("max_iterations")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_ITERATIONS)
    }

    /// Loop-mode stop condition: a dotted output key whose appearance ends
    /// the loop (`metadata.stop_on_output`).
    pub fn stop_on_output(&self) -> Option<&str> {
        self.metadata.get("stop_on_output").and_then(Value::as_str)
    }

    /// Fork-join branches from `metadata.branches`: a map of branch name to
    /// an ordered list of step ids. Returns `None` when absent or malformed.
    pub fn branches(&self) -> Option<Vec<(String, Vec<String>)>> {
        let obj = self.metadata.get("branches")?.as_object()?;
        let mut branches = Vec::with_capacity(obj.len());
        for (name, ids) in obj {
            let ids: Vec<String> = ids
                .as_array()?
                .iter()
                .map(|v| v.as_str().map(String::from))
                .collect::<Option<_>>()?;
            branches.push((name.clone(), ids));
        }
        Some(branches)
    }
}

/// Default bound on loop-mode iterations, guarding against runaway loops.
pub const DEFAULT_MAX_ITERATIONS: u64 = 100;

/// The topology strategy that drives a workflow's steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
    Conditional,
    Loop,
    ForkJoin,
}

/// How a workflow execution was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Scheduled,
    EventDriven,
    ConditionBased,
    ApiCall,
}

// ---------------------------------------------------------------------------
// Step definition
// ---------------------------------------------------------------------------

/// A single unit of work within a workflow, delegated to the job service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step id, unique within the workflow (e.g. "collect-records").
    pub id: String,
    /// Human-readable step name.
    pub name: String,
    /// Opaque job type interpreted by the job service.
    pub step_type: String,
    /// Named input slots passed to the job.
    #[serde(default)]
    pub inputs: serde_json::Map<String, Value>,
    /// Advisory resource requirements (resource name -> quantity).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub resource_requirements: HashMap<String, f64>,
    /// Step-level timeout in seconds (engine default applies when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Retry policy for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Step ids that must complete before this step runs.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// How the resolver should treat this step's dependency edges.
    #[serde(default)]
    pub dependency_kind: DependencyKind,
    /// Predicates over accumulated step outputs; all must hold for the step
    /// to run in conditional mode.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<StepCondition>,
    /// Extensible step annotations.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

/// Classification of a step's dependency edges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    #[default]
    Sequential,
    Parallel,
    Conditional,
    Exclusive,
    Inclusive,
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Retry policy for a workflow step.
///
/// A step with `max_retries = k` is attempted at most `k + 1` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt (default 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between attempts in seconds (default 5).
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_secs() -> u64 {
    5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Step conditions (closed predicate set)
// ---------------------------------------------------------------------------

/// A predicate over accumulated step outputs.
///
/// `key` is a dotted path: the first segment is a step id, the remaining
/// segments index into that step's output JSON (e.g. `"analyze.score"`).
/// Numeric comparisons treat a missing or non-numeric value as false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StepCondition {
    Equals { key: String, value: Value },
    NotEquals { key: String, value: Value },
    GreaterThan { key: String, value: f64 },
    LessThan { key: String, value: f64 },
    AtLeast { key: String, value: f64 },
    AtMost { key: String, value: f64 },
    OutputPresent { key: String },
}

impl StepCondition {
    /// Evaluate the predicate against accumulated outputs keyed by step id.
    pub fn evaluate(&self, outputs: &HashMap<String, Value>) -> bool {
        match self {
            StepCondition::Equals { key, value } => {
                lookup_output(outputs, key).is_some_and(|v| v == value)
            }
            StepCondition::NotEquals { key, value } => {
                lookup_output(outputs, key).is_some_and(|v| v != value)
            }
            StepCondition::GreaterThan { key, value } => {
                lookup_number(outputs, key).is_some_and(|n| n > *value)
            }
            StepCondition::LessThan { key, value } => {
                lookup_number(outputs, key).is_some_and(|n| n < *value)
            }
            StepCondition::AtLeast { key, value } => {
                lookup_number(outputs, key).is_some_and(|n| n >= *value)
            }
            StepCondition::AtMost { key, value } => {
                lookup_number(outputs, key).is_some_and(|n| n <= *value)
            }
            StepCondition::OutputPresent { key } => lookup_output(outputs, key).is_some(),
        }
    }
}

/// Resolve a dotted key against the output map.
///
/// `"analyze"` returns the whole output of step `analyze`;
/// `"analyze.score.raw"` walks into the JSON object.
pub fn lookup_output<'a>(outputs: &'a HashMap<String, Value>, key: &str) -> Option<&'a Value> {
    let mut segments = key.split('.');
    let step_id = segments.next()?;
    let mut current = outputs.get(step_id)?;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}

fn lookup_number(outputs: &HashMap<String, Value>, key: &str) -> Option<f64> {
    lookup_output(outputs, key).and_then(Value::as_f64)
}

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Overall status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Status of an individual step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
    Waiting,
}

// ---------------------------------------------------------------------------
// Execution tracking
// ---------------------------------------------------------------------------

/// One run of a workflow, carrying all mutable progress state.
///
/// Mutation is owned exclusively by the engine task driving the execution's
/// topology; monitor loops only read snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// UUIDv7 execution id.
    pub id: Uuid,
    /// The workflow definition being executed.
    pub workflow_id: Uuid,
    /// Current execution status.
    pub status: ExecutionStatus,
    /// How this execution was started.
    pub trigger: TriggerKind,
    /// Step currently being driven (sequential-style modes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Step ids that completed, in completion order.
    #[serde(default)]
    pub completed_steps: Vec<String>,
    /// Step ids whose retries were exhausted.
    #[serde(default)]
    pub failed_steps: HashSet<String>,
    /// Step ids currently running.
    #[serde(default)]
    pub running_steps: HashSet<String>,
    /// Per-step execution records, keyed by step id.
    #[serde(default)]
    pub step_records: HashMap<String, StepExecutionRecord>,
    /// When the execution was created.
    pub started_at: DateTime<Utc>,
    /// When the execution reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Failure reason, when `status` is Failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Automatic recovery attempts consumed (bounded to one).
    #[serde(default)]
    pub recovery_attempts: u32,
    /// Engine bookkeeping (e.g. loop iterations completed).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowExecution {
    /// Create a fresh Pending execution for a workflow.
    pub fn new(workflow_id: Uuid, trigger: TriggerKind) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            status: ExecutionStatus::Pending,
            trigger,
            current_step: None,
            completed_steps: Vec::new(),
            failed_steps: HashSet::new(),
            running_steps: HashSet::new(),
            step_records: HashMap::new(),
            started_at: Utc::now(),
            ended_at: None,
            error: None,
            recovery_attempts: 0,
            metadata: HashMap::new(),
        }
    }

    /// Accumulated outputs of completed steps, keyed by step id.
    pub fn outputs(&self) -> HashMap<String, Value> {
        self.step_records
            .iter()
            .filter_map(|(id, rec)| rec.output.clone().map(|out| (id.clone(), out)))
            .collect()
    }

    /// Mark a step as running and record the attempt.
    pub fn mark_step_running(&mut self, step_id: &str, attempt: u32) {
        self.current_step = Some(step_id.to_string());
        self.running_steps.insert(step_id.to_string());
        let record = self
            .step_records
            .entry(step_id.to_string())
            .or_insert_with(StepExecutionRecord::new);
        record.status = StepStatus::Running;
        record.attempt = attempt;
        record.started_at = Some(Utc::now());
        record.ended_at = None;
        record.error = None;
    }

    /// Fold a finished `StepResult` into the execution state.
    pub fn record_step_result(&mut self, result: &StepResult) {
        self.running_steps.remove(&result.step_id);
        let record = self
            .step_records
            .entry(result.step_id.clone())
            .or_insert_with(StepExecutionRecord::new);
        record.status = result.status;
        record.attempt = result.attempts;
        record.output = result.output.clone();
        record.error = result.error.clone();
        record.ended_at = Some(Utc::now());

        match result.status {
            StepStatus::Completed => {
                self.completed_steps.push(result.step_id.clone());
                self.failed_steps.remove(&result.step_id);
            }
            StepStatus::Failed => {
                self.failed_steps.insert(result.step_id.clone());
            }
            _ => {}
        }
    }

    /// Record a skipped step (conditional mode, unmet predicate).
    pub fn record_step_skipped(&mut self, step_id: &str) {
        let record = self
            .step_records
            .entry(step_id.to_string())
            .or_insert_with(StepExecutionRecord::new);
        record.status = StepStatus::Skipped;
        record.ended_at = Some(Utc::now());
    }

    /// Transition to a terminal Failed state.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = ExecutionStatus::Failed;
        self.error = Some(error.into());
        self.ended_at = Some(Utc::now());
        self.running_steps.clear();
        self.current_step = None;
    }

    /// Transition to the terminal Completed state.
    pub fn complete(&mut self) {
        self.status = ExecutionStatus::Completed;
        self.ended_at = Some(Utc::now());
        self.running_steps.clear();
        self.current_step = None;
    }

    /// Transition to the terminal Cancelled state, marking any running
    /// steps as cancelled.
    pub fn cancel(&mut self) {
        for step_id in self.running_steps.drain() {
            if let Some(record) = self.step_records.get_mut(&step_id) {
                record.status = StepStatus::Cancelled;
                record.ended_at = Some(Utc::now());
            }
        }
        self.status = ExecutionStatus::Cancelled;
        self.ended_at = Some(Utc::now());
        self.current_step = None;
    }

    /// Reset progress for a bounded recovery restart: clears step progress
    /// and the error, returns the execution to Pending, and consumes one
    /// recovery attempt.
    pub fn reset_for_recovery(&mut self) {
        self.status = ExecutionStatus::Pending;
        self.current_step = None;
        self.completed_steps.clear();
        self.failed_steps.clear();
        self.running_steps.clear();
        self.step_records.clear();
        self.ended_at = None;
        self.error = None;
        self.recovery_attempts += 1;
    }

    /// Wall-clock duration, up to `ended_at` or now.
    pub fn duration_ms(&self) -> u64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// Execution record for a single step within one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    /// Current step status.
    pub status: StepStatus,
    /// Attempt number (1-based; increments on retry).
    pub attempt: u32,
    /// Output payload produced by the job, when completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error message, when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the latest attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl StepExecutionRecord {
    /// A fresh Pending record with no attempts.
    pub fn new() -> Self {
        Self {
            status: StepStatus::Pending,
            attempt: 0,
            output: None,
            error: None,
            started_at: None,
            ended_at: None,
        }
    }
}

impl Default for StepExecutionRecord {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Step result
// ---------------------------------------------------------------------------

/// Outcome of driving one step to a terminal state (retries included).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// The step that was executed.
    pub step_id: String,
    /// Terminal step status (Completed, Failed, or Cancelled).
    pub status: StepStatus,
    /// Output payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Failure reason on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Total attempts made (1-based).
    pub attempts: u32,
    /// Wall-clock execution time across all attempts.
    pub duration_ms: u64,
}

impl StepResult {
    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == StepStatus::Cancelled
    }
}

// ---------------------------------------------------------------------------
// Aggregate metrics
// ---------------------------------------------------------------------------

/// Process-wide aggregate workflow metrics.
///
/// Recomputed by the metrics loop from the executions map; best-effort and
/// eventually consistent, never transactional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    /// Total executions known to the engine.
    pub total_executions: u64,
    /// Executions that completed successfully.
    pub completed: u64,
    /// Executions that failed.
    pub failed: u64,
    /// Executions that were cancelled.
    pub cancelled: u64,
    /// Executions currently running.
    pub running: u64,
    /// Running average execution duration over terminal executions.
    pub avg_duration_ms: f64,
    /// completed / total executions known to the engine.
    pub success_rate: f64,
    /// completed steps / (completed + failed steps) across all executions.
    pub step_success_rate: f64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
