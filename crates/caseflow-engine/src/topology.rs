//! The five execution topologies.
//!
//! `TopologyRunner` drives a RUNNING execution to a terminal state according
//! to the workflow's `ExecutionMode`:
//!
//! - Sequential: declared order, polling-wait for readiness, stop on failure
//! - Parallel: dependency levels, each level in a `JoinSet`; already-launched
//!   siblings finish before the execution fails
//! - Conditional: sequential order, step predicates over accumulated outputs;
//!   unmet predicates record Skipped and execution continues
//! - Loop: the full ordered list repeats up to `max_iterations`, stopping
//!   early when the `stop_on_output` key appears
//! - Fork-Join: named branches run concurrently as sequential sub-sequences;
//!   the join requires all of them, then remaining steps run sequentially
//!
//! Completed steps are never rolled back on failure.

use std::collections::HashSet;
use std::sync::Arc;

use caseflow_types::workflow::{
    lookup_output, ExecutionMode, StepResult, StepStatus, Workflow, WorkflowExecution,
    WorkflowStep,
};
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::event::EventBus;
use crate::executor::StepExecutor;
use crate::job::JobService;
use crate::resolver::{compute_levels, wait_until_ready, ReadyWait};

// ---------------------------------------------------------------------------
// Drive outcome
// ---------------------------------------------------------------------------

/// Terminal outcome of driving one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DriveOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

// ---------------------------------------------------------------------------
// TopologyRunner
// ---------------------------------------------------------------------------

/// Drives executions through their workflow's topology strategy.
pub(crate) struct TopologyRunner<J: JobService> {
    executor: StepExecutor<J>,
    events: EventBus,
    config: EngineConfig,
}

impl<J: JobService> Clone for TopologyRunner<J> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
        }
    }
}

impl<J: JobService + 'static> TopologyRunner<J> {
    pub(crate) fn new(executor: StepExecutor<J>, events: EventBus, config: EngineConfig) -> Self {
        Self {
            executor,
            events,
            config,
        }
    }

    /// Drive the execution to a terminal state and fold the outcome into it.
    ///
    /// The execution must already be RUNNING. If another path (cancellation,
    /// timeout monitor) made it terminal first, that state wins.
    pub(crate) async fn drive(
        &self,
        workflow: &Arc<Workflow>,
        execution: &Arc<RwLock<WorkflowExecution>>,
        cancel: &CancellationToken,
    ) -> DriveOutcome {
        let outcome = match workflow.execution_mode {
            ExecutionMode::Sequential => {
                self.run_sequence(&workflow.steps, execution, cancel, false)
                    .await
            }
            ExecutionMode::Conditional => {
                self.run_sequence(&workflow.steps, execution, cancel, true)
                    .await
            }
            ExecutionMode::Parallel => self.run_parallel(workflow, execution, cancel).await,
            ExecutionMode::Loop => self.run_loop(workflow, execution, cancel).await,
            ExecutionMode::ForkJoin => self.run_fork_join(workflow, execution, cancel).await,
        };

        let mut guard = execution.write().await;
        if !guard.status.is_terminal() {
            match &outcome {
                DriveOutcome::Completed => guard.complete(),
                DriveOutcome::Failed(error) => guard.fail(error.clone()),
                DriveOutcome::Cancelled => guard.cancel(),
            }
        }
        outcome
    }

    // -----------------------------------------------------------------------
    // Sequential / Conditional
    // -----------------------------------------------------------------------

    /// Run steps in declared order. With `conditional` set, step predicates
    /// are evaluated against accumulated outputs and an unmet predicate
    /// records Skipped; skipped steps satisfy their dependents.
    async fn run_sequence(
        &self,
        steps: &[WorkflowStep],
        execution: &Arc<RwLock<WorkflowExecution>>,
        cancel: &CancellationToken,
        conditional: bool,
    ) -> DriveOutcome {
        for step in steps {
            if cancel.is_cancelled() {
                return DriveOutcome::Cancelled;
            }
            // In conditional mode a skipped dependency satisfies dependents
            let ready = if conditional {
                self.wait_completed_or_skipped(step, execution, cancel).await
            } else {
                wait_until_ready(step, execution, self.config.dependency_poll(), cancel).await
                    == ReadyWait::Ready
            };
            if !ready {
                return DriveOutcome::Cancelled;
            }

            if conditional && !step.conditions.is_empty() {
                let (execution_id, outputs) = {
                    let guard = execution.read().await;
                    (guard.id, guard.outputs())
                };
                if !step.conditions.iter().all(|c| c.evaluate(&outputs)) {
                    execution.write().await.record_step_skipped(&step.id);
                    self.events.step_skipped(execution_id, &step.id);
                    tracing::debug!(
                        execution_id = %execution_id,
                        step_id = step.id.as_str(),
                        "step skipped, conditions unmet"
                    );
                    continue;
                }
            }

            let result = self.executor.execute_step(execution, step, cancel).await;
            if let Some(outcome) = step_stops_sequence(&result) {
                return outcome;
            }
        }
        DriveOutcome::Completed
    }

    /// Poll until the step's dependencies are completed or skipped, or the
    /// token fires. Returns `false` on cancellation.
    async fn wait_completed_or_skipped(
        &self,
        step: &WorkflowStep,
        execution: &Arc<RwLock<WorkflowExecution>>,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            {
                let guard = execution.read().await;
                let satisfied = step.depends_on.iter().all(|dep| {
                    guard.completed_steps.contains(dep)
                        || guard
                            .step_records
                            .get(dep)
                            .is_some_and(|r| r.status == StepStatus::Skipped)
                });
                if satisfied {
                    return true;
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.config.dependency_poll()) => {}
            }
        }
    }

    // -----------------------------------------------------------------------
    // Parallel
    // -----------------------------------------------------------------------

    /// Run dependency levels one at a time, each level as a `JoinSet`. A
    /// failing step does not abort its level: launched siblings run to their
    /// own terminal state before the execution fails.
    async fn run_parallel(
        &self,
        workflow: &Arc<Workflow>,
        execution: &Arc<RwLock<WorkflowExecution>>,
        cancel: &CancellationToken,
    ) -> DriveOutcome {
        let levels = match compute_levels(&workflow.steps) {
            Ok(levels) => levels,
            Err(err) => return DriveOutcome::Failed(err.to_string()),
        };

        for level in levels {
            if cancel.is_cancelled() {
                return DriveOutcome::Cancelled;
            }
            let mut set = JoinSet::new();
            for step_id in level {
                let Some(step) = workflow.step(&step_id) else {
                    continue;
                };
                let step = step.clone();
                let executor = self.executor.clone();
                let execution = Arc::clone(execution);
                let cancel = cancel.clone();
                set.spawn(async move { executor.execute_step(&execution, &step, &cancel).await });
            }

            let mut cancelled = false;
            let mut failure: Option<String> = None;
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(result) => {
                        if result.is_cancelled() {
                            cancelled = true;
                        } else if !result.is_completed() && failure.is_none() {
                            failure = Some(step_failure_message(&result));
                        }
                    }
                    Err(err) => {
                        if failure.is_none() {
                            failure = Some(format!("step task failed: {err}"));
                        }
                    }
                }
            }
            if cancelled {
                return DriveOutcome::Cancelled;
            }
            if let Some(error) = failure {
                return DriveOutcome::Failed(error);
            }
        }
        DriveOutcome::Completed
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    /// Repeat the full step list up to `max_iterations`, clearing
    /// per-iteration progress between passes. Stops early when the
    /// `stop_on_output` key resolves against accumulated outputs.
    async fn run_loop(
        &self,
        workflow: &Arc<Workflow>,
        execution: &Arc<RwLock<WorkflowExecution>>,
        cancel: &CancellationToken,
    ) -> DriveOutcome {
        let max_iterations = workflow.max_iterations();
        for iteration in 1..=max_iterations {
            if iteration > 1 {
                let mut guard = execution.write().await;
                guard.completed_steps.clear();
                guard.failed_steps.clear();
            }

            match self
                .run_sequence(&workflow.steps, execution, cancel, false)
                .await
            {
                DriveOutcome::Completed => {}
                other => return other,
            }

            execution
                .write()
                .await
                .metadata
                .insert("iterations".to_string(), json!(iteration));

            if let Some(key) = workflow.stop_on_output() {
                let outputs = execution.read().await.outputs();
                if lookup_output(&outputs, key).is_some() {
                    tracing::info!(
                        workflow = %workflow.id,
                        iteration,
                        stop_key = key,
                        "loop stop condition met"
                    );
                    break;
                }
            }
        }
        DriveOutcome::Completed
    }

    // -----------------------------------------------------------------------
    // Fork-Join
    // -----------------------------------------------------------------------

    /// Run `metadata.branches` concurrently, join all of them, then run any
    /// steps outside the branches sequentially. Without branch metadata the
    /// workflow degrades to sequential execution.
    async fn run_fork_join(
        &self,
        workflow: &Arc<Workflow>,
        execution: &Arc<RwLock<WorkflowExecution>>,
        cancel: &CancellationToken,
    ) -> DriveOutcome {
        let Some(branches) = workflow.branches() else {
            tracing::warn!(
                workflow = %workflow.id,
                "fork-join workflow has no branches, running sequentially"
            );
            return self
                .run_sequence(&workflow.steps, execution, cancel, false)
                .await;
        };

        let mut set = JoinSet::new();
        for (name, step_ids) in &branches {
            let steps: Vec<WorkflowStep> = step_ids
                .iter()
                .filter_map(|id| workflow.step(id).cloned())
                .collect();
            let runner = self.clone();
            let execution = Arc::clone(execution);
            let cancel = cancel.clone();
            let name = name.clone();
            set.spawn(async move {
                tracing::debug!(branch = name.as_str(), "branch started");
                let outcome = runner.run_sequence(&steps, &execution, &cancel, false).await;
                (name, outcome)
            });
        }

        let mut cancelled = false;
        let mut failure: Option<String> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, DriveOutcome::Failed(error))) => {
                    if failure.is_none() {
                        failure = Some(format!("branch '{name}' failed: {error}"));
                    }
                }
                Ok((_, DriveOutcome::Cancelled)) => cancelled = true,
                Ok((_, DriveOutcome::Completed)) => {}
                Err(err) => {
                    if failure.is_none() {
                        failure = Some(format!("branch task failed: {err}"));
                    }
                }
            }
        }
        if cancelled {
            return DriveOutcome::Cancelled;
        }
        if let Some(error) = failure {
            return DriveOutcome::Failed(error);
        }

        let in_branch: HashSet<&str> = branches
            .iter()
            .flat_map(|(_, ids)| ids.iter().map(String::as_str))
            .collect();
        let remaining: Vec<WorkflowStep> = workflow
            .steps
            .iter()
            .filter(|s| !in_branch.contains(s.id.as_str()))
            .cloned()
            .collect();
        self.run_sequence(&remaining, execution, cancel, false).await
    }
}

/// Map a terminal step result to the outcome that stops a sequence, if any.
fn step_stops_sequence(result: &StepResult) -> Option<DriveOutcome> {
    if result.is_cancelled() {
        return Some(DriveOutcome::Cancelled);
    }
    if !result.is_completed() {
        return Some(DriveOutcome::Failed(step_failure_message(result)));
    }
    None
}

fn step_failure_message(result: &StepResult) -> String {
    format!(
        "step '{}' failed after {} attempt(s): {}",
        result.step_id,
        result.attempts,
        result.error.as_deref().unwrap_or("unknown error")
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
