//! Workflow execution engine for Caseflow.
//!
//! Drives declarative multi-step workflows to completion by delegating each
//! step to an external job service, while enforcing dependency ordering,
//! a global concurrency cap, per-step retries and timeouts, and bounded
//! failure recovery. The engine is an instantiable value (no process-wide
//! globals): construct a `WorkflowEngine`, `start()` it, and talk to it
//! through its public surface.
//!
//! - `config` -- engine tunables (TOML-loadable)
//! - `event` -- broadcast bus for `WorkflowEvent`
//! - `resolver` -- readiness checks, dependency levels, cycle detection
//! - `job` -- the job-service port and the simulated fallback
//! - `executor` -- per-step execution with retry/timeout
//! - `topology` -- the five execution strategies
//! - `engine` -- admission queue, scheduling loop, public surface
//! - `monitor` -- timeout / recovery / GC / metrics background loops
//! - `template` -- workflow templates and parameter substitution

pub mod config;
pub mod engine;
pub mod event;
pub mod executor;
pub mod job;
pub mod monitor;
pub mod resolver;
pub mod template;
pub mod topology;

pub use config::EngineConfig;
pub use engine::{EngineError, WorkflowEngine};
pub use job::{JobService, JobServiceError, SimulatedJobService};
