//! The workflow engine: registries, admission queue, scheduling loop, and
//! the public control surface.
//!
//! `WorkflowEngine` is an instantiable value behind an `Arc`; there are no
//! process-wide globals. Starting a workflow is always asynchronous: the
//! execution is created PENDING, queued FIFO, and picked up by the scheduling
//! loop while the number of RUNNING executions stays under
//! `max_concurrent_workflows`. One driver task per execution dispatches the
//! workflow's topology strategy and folds the outcome back into the
//! execution record.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use caseflow_types::event::WorkflowEvent;
use caseflow_types::workflow::{
    ExecutionStatus, TriggerKind, Workflow, WorkflowExecution, WorkflowMetrics,
};
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::event::EventBus;
use crate::executor::StepExecutor;
use crate::job::{JobService, SimulatedJobService};
use crate::resolver::{validate_workflow, WorkflowError};
use crate::template::{TemplateError, TemplateStore};
use crate::topology::{DriveOutcome, TopologyRunner};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    /// No workflow registered under the given id.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// The RUNNING-execution cap is reached; retry once a slot frees.
    #[error("concurrency limit reached: {running} of {limit} executions running")]
    ConcurrencyLimit { running: usize, limit: usize },

    /// Template lookup or parse failure.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Structural validation failure at workflow creation.
    #[error(transparent)]
    Validation(#[from] WorkflowError),
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Orchestrates workflow executions against a job-service backend.
pub struct WorkflowEngine<J: JobService> {
    pub(crate) config: EngineConfig,
    pub(crate) templates: TemplateStore,
    pub(crate) workflows: DashMap<Uuid, Arc<Workflow>>,
    pub(crate) executions: DashMap<Uuid, Arc<RwLock<WorkflowExecution>>>,
    pub(crate) cancel_tokens: DashMap<Uuid, CancellationToken>,
    pub(crate) queue: Mutex<VecDeque<Uuid>>,
    pub(crate) metrics: RwLock<WorkflowMetrics>,
    /// RUNNING executions; compared against `max_concurrent_workflows`.
    pub(crate) active: AtomicUsize,
    pub(crate) events: EventBus,
    pub(crate) jobs: Arc<J>,
    pub(crate) root_cancel: CancellationToken,
}

impl WorkflowEngine<SimulatedJobService> {
    /// Engine wired to the simulated job service, the fallback backend used
    /// when no real one is configured.
    pub fn simulated(config: EngineConfig) -> Arc<Self> {
        Self::new(config, Arc::new(SimulatedJobService::default()))
    }
}

impl<J: JobService + 'static> WorkflowEngine<J> {
    pub fn new(config: EngineConfig, jobs: Arc<J>) -> Arc<Self> {
        let events = EventBus::new(config.event_capacity);
        Arc::new(Self {
            config,
            templates: TemplateStore::new(),
            workflows: DashMap::new(),
            executions: DashMap::new(),
            cancel_tokens: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
            metrics: RwLock::new(WorkflowMetrics::default()),
            active: AtomicUsize::new(0),
            events,
            jobs,
            root_cancel: CancellationToken::new(),
        })
    }

    /// Template registry (register templates before `create_workflow`).
    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    /// Subscribe to engine lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Workflow creation
    // -----------------------------------------------------------------------

    /// Mint a workflow from a registered template, substituting `params`
    /// once, then validate and store it.
    pub fn create_workflow(
        &self,
        template_name: &str,
        params: &HashMap<String, Value>,
    ) -> Result<Uuid, EngineError> {
        let template = self.templates.get(template_name)?;
        let workflow = template.instantiate(params);
        self.register_workflow(workflow)
    }

    /// Validate and store a fully-formed workflow definition.
    pub fn register_workflow(&self, workflow: Workflow) -> Result<Uuid, EngineError> {
        validate_workflow(&workflow)?;
        let workflow_id = workflow.id;
        tracing::info!(
            workflow_id = %workflow_id,
            name = workflow.name.as_str(),
            mode = ?workflow.execution_mode,
            steps = workflow.steps.len(),
            "workflow registered"
        );
        self.workflows.insert(workflow_id, Arc::new(workflow));
        Ok(workflow_id)
    }

    pub fn get_workflow(&self, workflow_id: Uuid) -> Option<Arc<Workflow>> {
        self.workflows
            .get(&workflow_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    // -----------------------------------------------------------------------
    // Execution control
    // -----------------------------------------------------------------------

    /// Admit a new execution for a workflow. Never runs anything
    /// synchronously: the execution is created PENDING, queued, and returned
    /// immediately. Rejected when the RUNNING cap is already reached.
    pub async fn start_workflow(
        &self,
        workflow_id: Uuid,
        trigger: TriggerKind,
    ) -> Result<Uuid, EngineError> {
        if !self.workflows.contains_key(&workflow_id) {
            return Err(EngineError::WorkflowNotFound(workflow_id));
        }
        let running = self.active.load(Ordering::SeqCst);
        if running >= self.config.max_concurrent_workflows {
            return Err(EngineError::ConcurrencyLimit {
                running,
                limit: self.config.max_concurrent_workflows,
            });
        }

        let execution = WorkflowExecution::new(workflow_id, trigger);
        let execution_id = execution.id;
        self.executions
            .insert(execution_id, Arc::new(RwLock::new(execution)));
        // Token created at admission so queued executions are cancellable
        self.cancel_tokens
            .insert(execution_id, self.root_cancel.child_token());
        self.queue.lock().await.push_back(execution_id);

        self.events.publish(WorkflowEvent::ExecutionEnqueued {
            execution_id,
            workflow_id,
        });
        tracing::info!(
            execution_id = %execution_id,
            workflow_id = %workflow_id,
            trigger = ?trigger,
            "execution enqueued"
        );
        Ok(execution_id)
    }

    /// Cancel an execution. Idempotent: returns `false` when the execution
    /// is unknown or already terminal, `true` when this call cancelled it.
    pub async fn cancel_workflow(&self, execution_id: Uuid) -> bool {
        let Some(execution) = self.get_execution_handle(execution_id) else {
            return false;
        };
        {
            let mut guard = execution.write().await;
            if guard.status.is_terminal() {
                return false;
            }
            guard.cancel();
        }
        if let Some(token) = self.cancel_tokens.get(&execution_id) {
            token.cancel();
        }
        self.events
            .publish(WorkflowEvent::ExecutionCancelled { execution_id });
        tracing::info!(execution_id = %execution_id, "execution cancelled");
        true
    }

    pub async fn get_workflow_status(&self, execution_id: Uuid) -> Option<ExecutionStatus> {
        let execution = self.get_execution_handle(execution_id)?;
        let status = execution.read().await.status;
        Some(status)
    }

    /// Point-in-time snapshot of an execution.
    pub async fn get_execution(&self, execution_id: Uuid) -> Option<WorkflowExecution> {
        let execution = self.get_execution_handle(execution_id)?;
        let snapshot = execution.read().await.clone();
        Some(snapshot)
    }

    /// Latest aggregate metrics (recomputed by the metrics loop).
    pub async fn get_workflow_metrics(&self) -> WorkflowMetrics {
        self.metrics.read().await.clone()
    }

    pub(crate) fn get_execution_handle(
        &self,
        execution_id: Uuid,
    ) -> Option<Arc<RwLock<WorkflowExecution>>> {
        self.executions
            .get(&execution_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Spawn the scheduling loop and the background monitors.
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(
                cap = engine.config.max_concurrent_workflows,
                "scheduling loop started"
            );
            loop {
                tokio::select! {
                    _ = engine.root_cancel.cancelled() => {
                        tracing::info!("scheduling loop stopped");
                        return;
                    }
                    _ = tokio::time::sleep(engine.config.scheduler_poll()) => {
                        engine.schedule_ready().await;
                    }
                }
            }
        });
        crate::monitor::spawn_monitors(self);
    }

    /// Stop the scheduler, the monitors, and every in-flight execution.
    pub fn shutdown(&self) {
        tracing::info!("engine shutting down");
        self.root_cancel.cancel();
    }

    /// Pop queued executions while a RUNNING slot is free, one driver task
    /// each. Executions cancelled while queued are dropped here.
    pub(crate) async fn schedule_ready(self: &Arc<Self>) {
        loop {
            if self.active.load(Ordering::SeqCst) >= self.config.max_concurrent_workflows {
                return;
            }
            let Some(execution_id) = self.queue.lock().await.pop_front() else {
                return;
            };
            let Some(execution) = self.get_execution_handle(execution_id) else {
                continue;
            };
            if execution.read().await.status != ExecutionStatus::Pending {
                continue;
            }
            self.active.fetch_add(1, Ordering::SeqCst);
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.drive_execution(execution_id).await;
            });
        }
    }

    /// Drive one execution to a terminal state. Owns the RUNNING slot taken
    /// by the scheduler and releases it on every exit path.
    async fn drive_execution(self: Arc<Self>, execution_id: Uuid) {
        let outcome = self.run_to_terminal(execution_id).await;
        if let Some(outcome) = outcome {
            tracing::info!(execution_id = %execution_id, outcome = ?outcome, "execution finished");
        }
        self.cancel_tokens.remove(&execution_id);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    async fn run_to_terminal(&self, execution_id: Uuid) -> Option<DriveOutcome> {
        let execution = self.get_execution_handle(execution_id)?;
        let workflow_id = execution.read().await.workflow_id;
        let Some(workflow) = self.get_workflow(workflow_id) else {
            execution.write().await.fail("workflow definition missing");
            return Some(DriveOutcome::Failed("workflow definition missing".into()));
        };
        let cancel = self
            .cancel_tokens
            .get(&execution_id)
            .map(|t| t.value().clone())
            .unwrap_or_else(|| self.root_cancel.child_token());

        {
            let mut guard = execution.write().await;
            guard.status = ExecutionStatus::Running;
            // Timeout accounting starts when the execution leaves the queue
            guard.started_at = chrono::Utc::now();
        }
        self.events.publish(WorkflowEvent::ExecutionStarted {
            execution_id,
            workflow_name: workflow.name.clone(),
        });
        tracing::info!(
            execution_id = %execution_id,
            workflow = workflow.name.as_str(),
            mode = ?workflow.execution_mode,
            "execution started"
        );

        let runner = TopologyRunner::new(
            StepExecutor::new(
                Arc::clone(&self.jobs),
                self.config.clone(),
                self.events.clone(),
            ),
            self.events.clone(),
            self.config.clone(),
        );
        let limit = workflow
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.workflow_timeout());

        let outcome = match tokio::time::timeout(limit, runner.drive(&workflow, &execution, &cancel))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                cancel.cancel();
                let mut guard = execution.write().await;
                if !guard.status.is_terminal() {
                    guard.cancel();
                    guard.error = Some(format!("workflow timed out after {}s", limit.as_secs()));
                }
                drop(guard);
                self.events
                    .publish(WorkflowEvent::ExecutionTimedOut { execution_id });
                tracing::warn!(
                    execution_id = %execution_id,
                    timeout_secs = limit.as_secs(),
                    "execution timed out"
                );
                return Some(DriveOutcome::Cancelled);
            }
        };

        match &outcome {
            DriveOutcome::Completed => {
                let guard = execution.read().await;
                self.events.publish(WorkflowEvent::ExecutionCompleted {
                    execution_id,
                    duration_ms: guard.duration_ms(),
                    steps_completed: guard.completed_steps.len() as u32,
                });
            }
            DriveOutcome::Failed(error) => {
                self.events.publish(WorkflowEvent::ExecutionFailed {
                    execution_id,
                    error: error.clone(),
                });
            }
            // Cancellation was initiated (and published) elsewhere
            DriveOutcome::Cancelled => {}
        }
        Some(outcome)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
