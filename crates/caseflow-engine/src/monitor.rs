//! Background maintenance loops: timeout, recovery, garbage collection, and
//! metrics.
//!
//! Each sweep is an inherent method on `WorkflowEngine` so tests can invoke
//! it directly; `spawn_monitors` wires the sweeps to interval tickers that
//! stop on the engine's root cancellation token. Sweeps are best-effort and
//! never block an execution: they snapshot the registries, then act.

use std::sync::Arc;
use std::time::Duration;

use caseflow_types::event::WorkflowEvent;
use caseflow_types::workflow::{ExecutionStatus, StepStatus, WorkflowMetrics};
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::engine::WorkflowEngine;
use crate::job::JobService;

// ---------------------------------------------------------------------------
// Sweeps
// ---------------------------------------------------------------------------

impl<J: JobService + 'static> WorkflowEngine<J> {
    /// Force-cancel RUNNING executions older than their workflow timeout.
    ///
    /// Backstop for the per-driver timeout: catches executions whose driver
    /// task is gone or wedged.
    pub(crate) async fn timeout_sweep(&self) {
        let snapshot: Vec<_> = self
            .executions
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        for (execution_id, execution) in snapshot {
            let (status, started_at, workflow_id) = {
                let guard = execution.read().await;
                (guard.status, guard.started_at, guard.workflow_id)
            };
            if status != ExecutionStatus::Running {
                continue;
            }
            let limit = self
                .get_workflow(workflow_id)
                .and_then(|wf| wf.timeout_secs)
                .map(Duration::from_secs)
                .unwrap_or_else(|| self.config.workflow_timeout());
            let age = (Utc::now() - started_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age <= limit {
                continue;
            }

            {
                let mut guard = execution.write().await;
                if guard.status.is_terminal() {
                    continue;
                }
                guard.cancel();
                guard.error = Some(format!("workflow timed out after {}s", limit.as_secs()));
            }
            if let Some(token) = self.cancel_tokens.get(&execution_id) {
                token.cancel();
            }
            self.events
                .publish(WorkflowEvent::ExecutionTimedOut { execution_id });
            tracing::warn!(
                execution_id = %execution_id,
                age_secs = age.as_secs(),
                limit_secs = limit.as_secs(),
                "timeout sweep cancelled execution"
            );
        }
    }

    /// Re-enqueue FAILED executions that have not yet been recovered.
    ///
    /// Recovery restarts the whole execution: progress and error are
    /// cleared, status returns to Pending, and exactly one attempt is ever
    /// made per execution.
    pub(crate) async fn recovery_sweep(&self) {
        if !self.config.enable_recovery {
            return;
        }
        let snapshot: Vec<_> = self
            .executions
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        for (execution_id, execution) in snapshot {
            let recovery_attempt = {
                let mut guard = execution.write().await;
                if guard.status != ExecutionStatus::Failed || guard.recovery_attempts > 0 {
                    continue;
                }
                guard.reset_for_recovery();
                guard.recovery_attempts
            };
            self.cancel_tokens
                .insert(execution_id, self.root_cancel.child_token());
            self.queue.lock().await.push_back(execution_id);
            self.events.publish(WorkflowEvent::ExecutionRecovered {
                execution_id,
                recovery_attempt,
            });
            tracing::info!(
                execution_id = %execution_id,
                recovery_attempt,
                "failed execution re-enqueued for recovery"
            );
        }
    }

    /// Drop terminal executions whose `ended_at` is past the retention
    /// window, together with their step records.
    pub(crate) async fn gc_sweep(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention())
                .unwrap_or_else(|_| chrono::Duration::days(7));

        let snapshot: Vec<_> = self
            .executions
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut expired: Vec<Uuid> = Vec::new();
        for (execution_id, execution) in snapshot {
            let guard = execution.read().await;
            if guard.status.is_terminal() && guard.ended_at.is_some_and(|t| t < cutoff) {
                expired.push(execution_id);
            }
        }
        if expired.is_empty() {
            return;
        }
        for execution_id in &expired {
            self.executions.remove(execution_id);
            self.cancel_tokens.remove(execution_id);
        }
        tracing::info!(dropped = expired.len(), "gc sweep dropped old executions");
    }

    /// Recompute aggregate metrics from the executions map. Best-effort and
    /// eventually consistent.
    pub(crate) async fn refresh_metrics(&self) {
        let snapshot: Vec<_> = self
            .executions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut metrics = WorkflowMetrics {
            total_executions: snapshot.len() as u64,
            ..WorkflowMetrics::default()
        };
        let mut total_duration_ms = 0u64;
        let mut steps_completed = 0u64;
        let mut steps_failed = 0u64;

        for execution in snapshot {
            let guard = execution.read().await;
            match guard.status {
                ExecutionStatus::Completed => metrics.completed += 1,
                ExecutionStatus::Failed => metrics.failed += 1,
                ExecutionStatus::Cancelled => metrics.cancelled += 1,
                ExecutionStatus::Running => metrics.running += 1,
                ExecutionStatus::Pending => {}
            }
            if guard.status.is_terminal() {
                total_duration_ms += guard.duration_ms();
            }
            for record in guard.step_records.values() {
                match record.status {
                    StepStatus::Completed => steps_completed += 1,
                    StepStatus::Failed => steps_failed += 1,
                    _ => {}
                }
            }
        }

        let terminal = metrics.completed + metrics.failed + metrics.cancelled;
        if terminal > 0 {
            metrics.avg_duration_ms = total_duration_ms as f64 / terminal as f64;
        }
        if metrics.total_executions > 0 {
            metrics.success_rate = metrics.completed as f64 / metrics.total_executions as f64;
        }
        if steps_completed + steps_failed > 0 {
            metrics.step_success_rate =
                steps_completed as f64 / (steps_completed + steps_failed) as f64;
        }

        *self.metrics.write().await = metrics;
    }
}

// ---------------------------------------------------------------------------
// Interval wiring
// ---------------------------------------------------------------------------

/// Spawn the maintenance loops. Each stops when the root token fires.
pub(crate) fn spawn_monitors<J: JobService + 'static>(engine: &Arc<WorkflowEngine<J>>) {
    // Timeout + recovery share the monitor interval
    let e = Arc::clone(engine);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(e.config.monitor_interval_secs));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = e.root_cancel.cancelled() => return,
                _ = tick.tick() => {
                    e.timeout_sweep().await;
                    e.recovery_sweep().await;
                }
            }
        }
    });

    let e = Arc::clone(engine);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(e.config.gc_interval_secs));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = e.root_cancel.cancelled() => return,
                _ = tick.tick() => e.gc_sweep().await,
            }
        }
    });

    let e = Arc::clone(engine);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(e.config.metrics_interval_secs));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = e.root_cancel.cancelled() => return,
                _ = tick.tick() => e.refresh_metrics().await,
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
