//! Job-service port and the simulated fallback backend.
//!
//! The engine consumes a `JobService` to run step payloads. When no real
//! backend is configured, `SimulatedJobService` stands in: every job
//! completes successfully after a short fixed delay. The simulation is a
//! first-class behavior -- it is how the engine is exercised without a live
//! backend -- and supports scripted per-step failures so retry and failure
//! paths are testable too.

use std::time::{Duration, Instant};

use caseflow_types::job::{Job, JobSnapshot, JobStatus};
use dashmap::DashMap;
use serde_json::json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced by a job-service backend.
#[derive(Debug, thiserror::Error)]
pub enum JobServiceError {
    /// The backend rejected the submission.
    #[error("job submission failed: {0}")]
    Submission(String),

    /// The backend does not know the job id.
    #[error("unknown job: {0}")]
    UnknownJob(Uuid),

    /// The backend is unreachable or otherwise unavailable.
    #[error("job service unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// JobService trait
// ---------------------------------------------------------------------------

/// Port to the external job-execution backend.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods,
/// consistent with the project's Rust 2024 edition approach.
pub trait JobService: Send + Sync {
    /// Submit a job for execution; returns the backend's job id.
    fn submit(
        &self,
        job: Job,
    ) -> impl std::future::Future<Output = Result<Uuid, JobServiceError>> + Send;

    /// Poll a point-in-time view of a job (status, outputs, error).
    fn snapshot(
        &self,
        job_id: Uuid,
    ) -> impl std::future::Future<Output = Result<JobSnapshot, JobServiceError>> + Send;

    /// Best-effort cancellation of an in-flight job.
    fn cancel(
        &self,
        job_id: Uuid,
    ) -> impl std::future::Future<Output = Result<(), JobServiceError>> + Send;
}

// ---------------------------------------------------------------------------
// SimulatedJobService
// ---------------------------------------------------------------------------

/// Scripted failure behavior for one step id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureScript {
    /// Every submission for this step fails.
    Always,
    /// The next N submissions fail, then submissions succeed.
    Times(u32),
}

#[derive(Debug)]
struct SimulatedJob {
    submitted_at: Instant,
    will_fail: bool,
    cancelled: bool,
    outputs: serde_json::Value,
}

/// In-memory job backend: jobs complete successfully after a fixed delay,
/// echoing their inputs as outputs.
#[derive(Debug)]
pub struct SimulatedJobService {
    delay: Duration,
    jobs: DashMap<Uuid, SimulatedJob>,
    failures: DashMap<String, FailureScript>,
}

impl SimulatedJobService {
    /// Create a simulated backend with the given completion delay.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            jobs: DashMap::new(),
            failures: DashMap::new(),
        }
    }

    /// Script the next `times` submissions for `step_id` to fail.
    pub fn fail_step_times(&self, step_id: &str, times: u32) {
        self.failures
            .insert(step_id.to_string(), FailureScript::Times(times));
    }

    /// Script every submission for `step_id` to fail.
    pub fn fail_step_always(&self, step_id: &str) {
        self.failures
            .insert(step_id.to_string(), FailureScript::Always);
    }

    /// Number of jobs ever submitted.
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Consume one unit of the failure script for a step, if any.
    fn next_should_fail(&self, step_id: &str) -> bool {
        let Some(mut entry) = self.failures.get_mut(step_id) else {
            return false;
        };
        match *entry {
            FailureScript::Always => true,
            FailureScript::Times(0) => false,
            FailureScript::Times(n) => {
                *entry = FailureScript::Times(n - 1);
                true
            }
        }
    }
}

impl Default for SimulatedJobService {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl JobService for SimulatedJobService {
    async fn submit(&self, job: Job) -> Result<Uuid, JobServiceError> {
        let will_fail = self.next_should_fail(&job.step_id);
        let outputs = json!({
            "step_id": job.step_id,
            "job_type": job.job_type,
            "inputs": serde_json::Value::Object(job.inputs.clone()),
        });
        let job_id = job.id;
        tracing::debug!(
            job_id = %job_id,
            execution_id = %job.execution_id,
            step_id = job.step_id.as_str(),
            will_fail,
            "simulated job submitted"
        );
        self.jobs.insert(
            job_id,
            SimulatedJob {
                submitted_at: Instant::now(),
                will_fail,
                cancelled: false,
                outputs,
            },
        );
        Ok(job_id)
    }

    async fn snapshot(&self, job_id: Uuid) -> Result<JobSnapshot, JobServiceError> {
        let job = self
            .jobs
            .get(&job_id)
            .ok_or(JobServiceError::UnknownJob(job_id))?;

        if job.cancelled {
            return Ok(JobSnapshot {
                status: JobStatus::Cancelled,
                outputs: None,
                error: None,
            });
        }
        if job.submitted_at.elapsed() < self.delay {
            return Ok(JobSnapshot {
                status: JobStatus::Running,
                outputs: None,
                error: None,
            });
        }
        if job.will_fail {
            Ok(JobSnapshot {
                status: JobStatus::Failed,
                outputs: None,
                error: Some("simulated job failure".to_string()),
            })
        } else {
            Ok(JobSnapshot {
                status: JobStatus::Completed,
                outputs: Some(job.outputs.clone()),
                error: None,
            })
        }
    }

    async fn cancel(&self, job_id: Uuid) -> Result<(), JobServiceError> {
        let mut job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(JobServiceError::UnknownJob(job_id))?;
        job.cancelled = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use caseflow_types::workflow::{DependencyKind, WorkflowStep};
    use std::collections::HashMap;

    fn sample_job(step_id: &str) -> Job {
        let step = WorkflowStep {
            id: step_id.to_string(),
            name: step_id.to_string(),
            step_type: "analysis".to_string(),
            inputs: serde_json::Map::new(),
            resource_requirements: HashMap::new(),
            timeout_secs: None,
            retry: None,
            depends_on: vec![],
            dependency_kind: DependencyKind::Sequential,
            conditions: vec![],
            metadata: HashMap::new(),
        };
        Job::from_step(Uuid::now_v7(), &step)
    }

    #[tokio::test]
    async fn job_completes_after_delay() {
        let service = SimulatedJobService::new(Duration::from_millis(20));
        let job_id = service.submit(sample_job("collect")).await.unwrap();

        let snap = service.snapshot(job_id).await.unwrap();
        assert_eq!(snap.status, JobStatus::Running);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let snap = service.snapshot(job_id).await.unwrap();
        assert_eq!(snap.status, JobStatus::Completed);
        let outputs = snap.outputs.unwrap();
        assert_eq!(outputs["step_id"], "collect");
    }

    #[tokio::test]
    async fn scripted_failures_then_success() {
        let service = SimulatedJobService::new(Duration::from_millis(1));
        service.fail_step_times("analyze", 2);

        for expected_fail in [true, true, false] {
            let job_id = service.submit(sample_job("analyze")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            let snap = service.snapshot(job_id).await.unwrap();
            if expected_fail {
                assert_eq!(snap.status, JobStatus::Failed);
                assert!(snap.error.unwrap().contains("simulated"));
            } else {
                assert_eq!(snap.status, JobStatus::Completed);
            }
        }
    }

    #[tokio::test]
    async fn always_failing_step_never_succeeds() {
        let service = SimulatedJobService::new(Duration::from_millis(1));
        service.fail_step_always("analyze");

        for _ in 0..3 {
            let job_id = service.submit(sample_job("analyze")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            let snap = service.snapshot(job_id).await.unwrap();
            assert_eq!(snap.status, JobStatus::Failed);
        }
    }

    #[tokio::test]
    async fn cancel_marks_job_cancelled() {
        let service = SimulatedJobService::new(Duration::from_secs(10));
        let job_id = service.submit(sample_job("collect")).await.unwrap();

        service.cancel(job_id).await.unwrap();
        let snap = service.snapshot(job_id).await.unwrap();
        assert_eq!(snap.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn unknown_job_is_an_error() {
        let service = SimulatedJobService::default();
        let err = service.snapshot(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, JobServiceError::UnknownJob(_)));
    }
}
