//! Per-step execution: job submission, status polling, retry, timeout.
//!
//! `StepExecutor` drives exactly one step to a terminal `StepResult`. Retry
//! is an explicit bounded loop (`max_retries + 1` attempts at most), each
//! attempt bounded by the step timeout, and every wait point observes the
//! execution's cancellation token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use caseflow_types::job::{Job, JobStatus};
use caseflow_types::workflow::{
    RetryPolicy, StepResult, StepStatus, WorkflowExecution, WorkflowStep,
};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::event::EventBus;
use crate::job::JobService;

// ---------------------------------------------------------------------------
// Attempt outcome
// ---------------------------------------------------------------------------

/// Result of a single attempt, before retry policy is applied.
#[derive(Debug)]
enum AttemptOutcome {
    Completed(Option<Value>),
    Failed(String),
    TimedOut(Duration),
    Cancelled,
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Executes individual workflow steps against the job service.
///
/// Cheap to clone; each topology task carries its own copy.
pub struct StepExecutor<J: JobService> {
    jobs: Arc<J>,
    config: EngineConfig,
    events: EventBus,
}

impl<J: JobService> Clone for StepExecutor<J> {
    fn clone(&self) -> Self {
        Self {
            jobs: Arc::clone(&self.jobs),
            config: self.config.clone(),
            events: self.events.clone(),
        }
    }
}

impl<J: JobService> StepExecutor<J> {
    pub fn new(jobs: Arc<J>, config: EngineConfig, events: EventBus) -> Self {
        Self {
            jobs,
            config,
            events,
        }
    }

    /// Drive one step to a terminal result, applying its retry policy.
    ///
    /// The returned `StepResult` is already folded into `execution`; callers
    /// only need it to decide what to do next (stop, continue, cancel).
    pub async fn execute_step(
        &self,
        execution: &Arc<RwLock<WorkflowExecution>>,
        step: &WorkflowStep,
        cancel: &CancellationToken,
    ) -> StepResult {
        let policy = step.retry.unwrap_or(RetryPolicy {
            max_retries: 0,
            backoff_secs: 0,
        });
        let max_attempts = policy.max_retries + 1;
        let started = Instant::now();
        let execution_id = execution.read().await.id;

        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            execution.write().await.mark_step_running(&step.id, attempt);
            self.events.step_started(execution_id, &step.id, attempt);
            tracing::debug!(
                execution_id = %execution_id,
                step_id = step.id.as_str(),
                attempt,
                max_attempts,
                "step attempt started"
            );

            let error = match self.run_attempt(execution_id, step, cancel).await {
                AttemptOutcome::Completed(output) => {
                    let result = StepResult {
                        step_id: step.id.clone(),
                        status: StepStatus::Completed,
                        output,
                        error: None,
                        attempts: attempt,
                        duration_ms: started.elapsed().as_millis() as u64,
                    };
                    if !self.record_result(execution, &result).await {
                        return discard_late(result);
                    }
                    self.events
                        .step_completed(execution_id, &step.id, result.duration_ms);
                    tracing::info!(
                        execution_id = %execution_id,
                        step_id = step.id.as_str(),
                        attempts = attempt,
                        duration_ms = result.duration_ms,
                        "step completed"
                    );
                    return result;
                }
                AttemptOutcome::Cancelled => {
                    let result = StepResult {
                        step_id: step.id.clone(),
                        status: StepStatus::Cancelled,
                        output: None,
                        error: None,
                        attempts: attempt,
                        duration_ms: started.elapsed().as_millis() as u64,
                    };
                    self.record_result(execution, &result).await;
                    return result;
                }
                AttemptOutcome::Failed(error) => error,
                AttemptOutcome::TimedOut(limit) => {
                    format!("step timed out after {}s", limit.as_secs())
                }
            };

            let will_retry = attempt < max_attempts;
            tracing::warn!(
                execution_id = %execution_id,
                step_id = step.id.as_str(),
                attempt,
                will_retry,
                error = error.as_str(),
                "step attempt failed"
            );
            self.events
                .step_failed(execution_id, &step.id, &error, will_retry);
            last_error = error;

            if will_retry && policy.backoff_secs > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let result = StepResult {
                            step_id: step.id.clone(),
                            status: StepStatus::Cancelled,
                            output: None,
                            error: None,
                            attempts: attempt,
                            duration_ms: started.elapsed().as_millis() as u64,
                        };
                        self.record_result(execution, &result).await;
                        return result;
                    }
                    _ = tokio::time::sleep(Duration::from_secs(policy.backoff_secs)) => {}
                }
            }
        }

        let result = StepResult {
            step_id: step.id.clone(),
            status: StepStatus::Failed,
            output: None,
            error: Some(last_error),
            attempts: max_attempts,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if !self.record_result(execution, &result).await {
            return discard_late(result);
        }
        result
    }

    /// Fold a terminal step result into the execution, unless the execution
    /// itself already reached a terminal state. A job can finish in the
    /// window between `cancel_workflow` marking the execution Cancelled and
    /// the token firing; such late results must never be folded back in.
    async fn record_result(
        &self,
        execution: &Arc<RwLock<WorkflowExecution>>,
        result: &StepResult,
    ) -> bool {
        let mut guard = execution.write().await;
        if guard.status.is_terminal() {
            tracing::debug!(
                execution_id = %guard.id,
                step_id = result.step_id.as_str(),
                status = ?result.status,
                "late step result discarded, execution already terminal"
            );
            return false;
        }
        guard.record_step_result(result);
        true
    }

    /// One attempt: submit the job, then poll its status until it reaches a
    /// terminal state, the step timeout elapses, or the execution is
    /// cancelled. Timeout and cancellation both best-effort cancel the job.
    async fn run_attempt(
        &self,
        execution_id: Uuid,
        step: &WorkflowStep,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let job = Job::from_step(execution_id, step);
        let job_id = match self.jobs.submit(job).await {
            Ok(id) => id,
            Err(err) => return AttemptOutcome::Failed(err.to_string()),
        };

        let limit = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.default_step_timeout());

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = self.jobs.cancel(job_id).await;
                AttemptOutcome::Cancelled
            }
            polled = tokio::time::timeout(limit, self.poll_until_terminal(job_id)) => {
                match polled {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        let _ = self.jobs.cancel(job_id).await;
                        AttemptOutcome::TimedOut(limit)
                    }
                }
            }
        }
    }

    async fn poll_until_terminal(&self, job_id: Uuid) -> AttemptOutcome {
        loop {
            match self.jobs.snapshot(job_id).await {
                Ok(snap) => match snap.status {
                    JobStatus::Completed => return AttemptOutcome::Completed(snap.outputs),
                    JobStatus::Failed => {
                        return AttemptOutcome::Failed(
                            snap.error.unwrap_or_else(|| "job failed".to_string()),
                        );
                    }
                    JobStatus::Cancelled => return AttemptOutcome::Cancelled,
                    JobStatus::Pending | JobStatus::Running => {}
                },
                Err(err) => return AttemptOutcome::Failed(err.to_string()),
            }
            tokio::time::sleep(self.config.job_poll()).await;
        }
    }
}

/// Demote a discarded late result to Cancelled so callers never act on it.
fn discard_late(result: StepResult) -> StepResult {
    StepResult {
        status: StepStatus::Cancelled,
        output: None,
        error: None,
        ..result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::SimulatedJobService;
    use caseflow_types::event::WorkflowEvent;
    use caseflow_types::workflow::{DependencyKind, TriggerKind};
    use std::collections::HashMap;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            job_poll_ms: 5,
            default_step_timeout_secs: 30,
            ..EngineConfig::default()
        }
    }

    fn step(id: &str, retry: Option<RetryPolicy>) -> WorkflowStep {
        WorkflowStep {
            id: id.to_string(),
            name: id.to_string(),
            step_type: "analysis".to_string(),
            inputs: serde_json::Map::new(),
            resource_requirements: HashMap::new(),
            timeout_secs: None,
            retry,
            depends_on: vec![],
            dependency_kind: DependencyKind::Sequential,
            conditions: vec![],
            metadata: HashMap::new(),
        }
    }

    fn executor(
        delay: Duration,
        config: EngineConfig,
    ) -> (StepExecutor<SimulatedJobService>, Arc<SimulatedJobService>) {
        let jobs = Arc::new(SimulatedJobService::new(delay));
        let exec = StepExecutor::new(Arc::clone(&jobs), config, EventBus::new(64));
        (exec, jobs)
    }

    fn fresh_execution() -> Arc<RwLock<WorkflowExecution>> {
        Arc::new(RwLock::new(WorkflowExecution::new(
            Uuid::now_v7(),
            TriggerKind::Manual,
        )))
    }

    #[tokio::test]
    async fn successful_step_single_attempt() {
        let (exec, _) = executor(Duration::from_millis(10), fast_config());
        let execution = fresh_execution();
        let cancel = CancellationToken::new();

        let result = exec
            .execute_step(&execution, &step("collect", None), &cancel)
            .await;
        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.output.as_ref().unwrap()["step_id"], "collect");

        let guard = execution.read().await;
        assert_eq!(guard.completed_steps, vec!["collect"]);
        assert_eq!(guard.step_records["collect"].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn exhausted_retries_make_exactly_max_plus_one_attempts() {
        let (exec, jobs) = executor(Duration::from_millis(1), fast_config());
        jobs.fail_step_always("analyze");
        let execution = fresh_execution();
        let cancel = CancellationToken::new();

        let policy = RetryPolicy {
            max_retries: 2,
            backoff_secs: 0,
        };
        let result = exec
            .execute_step(&execution, &step("analyze", Some(policy)), &cancel)
            .await;
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 3);
        assert_eq!(jobs.job_count(), 3);
        assert!(result.error.unwrap().contains("simulated"));
        assert!(execution.read().await.failed_steps.contains("analyze"));
    }

    #[tokio::test]
    async fn transient_failures_recover_within_budget() {
        let (exec, jobs) = executor(Duration::from_millis(1), fast_config());
        jobs.fail_step_times("analyze", 2);
        let execution = fresh_execution();
        let cancel = CancellationToken::new();

        let policy = RetryPolicy {
            max_retries: 3,
            backoff_secs: 0,
        };
        let result = exec
            .execute_step(&execution, &step("analyze", Some(policy)), &cancel)
            .await;
        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn no_retry_policy_means_single_attempt() {
        let (exec, jobs) = executor(Duration::from_millis(1), fast_config());
        jobs.fail_step_always("analyze");
        let execution = fresh_execution();
        let cancel = CancellationToken::new();

        let result = exec
            .execute_step(&execution, &step("analyze", None), &cancel)
            .await;
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 1);
        assert_eq!(jobs.job_count(), 1);
    }

    #[tokio::test]
    async fn step_timeout_counts_as_a_failed_attempt() {
        // Job never finishes within the 1s step timeout
        let (exec, _) = executor(Duration::from_secs(60), fast_config());
        let execution = fresh_execution();
        let cancel = CancellationToken::new();

        let mut timed_step = step("collect", None);
        timed_step.timeout_secs = Some(1);
        let result = exec.execute_step(&execution, &timed_step, &cancel).await;
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.error.unwrap().contains("timed out after 1s"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_running_attempt() {
        let (exec, _) = executor(Duration::from_secs(60), fast_config());
        let execution = fresh_execution();
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let result = exec
            .execute_step(&execution, &step("collect", None), &cancel)
            .await;
        assert_eq!(result.status, StepStatus::Cancelled);
        assert_eq!(result.attempts, 1);
        assert_eq!(
            execution.read().await.step_records["collect"].status,
            StepStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn late_result_after_terminal_execution_is_discarded() {
        let (exec, _) = executor(Duration::from_millis(20), fast_config());
        let execution = fresh_execution();
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let exec = exec.clone();
            let execution = Arc::clone(&execution);
            let cancel = cancel.clone();
            let collect = step("collect", None);
            async move { exec.execute_step(&execution, &collect, &cancel).await }
        });

        // Execution turns terminal while the job is in flight; the token is
        // left unfired so the poll branch wins the race
        tokio::time::sleep(Duration::from_millis(5)).await;
        execution.write().await.cancel();

        let result = task.await.unwrap();
        assert_eq!(result.status, StepStatus::Cancelled);
        assert!(result.output.is_none());

        let guard = execution.read().await;
        assert_eq!(guard.status, caseflow_types::workflow::ExecutionStatus::Cancelled);
        assert!(guard.completed_steps.is_empty());
        assert_eq!(guard.step_records["collect"].status, StepStatus::Cancelled);
    }

    #[tokio::test]
    async fn step_events_published_in_order() {
        let jobs = Arc::new(SimulatedJobService::new(Duration::from_millis(1)));
        jobs.fail_step_times("analyze", 1);
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let exec = StepExecutor::new(Arc::clone(&jobs), fast_config(), bus);
        let execution = fresh_execution();

        let policy = RetryPolicy {
            max_retries: 1,
            backoff_secs: 0,
        };
        exec.execute_step(
            &execution,
            &step("analyze", Some(policy)),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(
            rx.recv().await.unwrap(),
            WorkflowEvent::StepStarted { attempt: 1, .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            WorkflowEvent::StepFailed {
                will_retry: true,
                ..
            }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            WorkflowEvent::StepStarted { attempt: 2, .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            WorkflowEvent::StepCompleted { .. }
        ));
    }
}
