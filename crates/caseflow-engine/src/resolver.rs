//! Dependency resolver: readiness checks, level computation, cycle detection.
//!
//! Uses `petgraph` to model step dependencies as a directed graph.
//! Topological sort detects cycles at workflow creation time, and depth-based
//! grouping produces dependency levels where all steps in a level can run
//! concurrently. Waiting on dependencies is a cooperative polling wait, never
//! a tight spin.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use caseflow_types::workflow::{Workflow, WorkflowExecution, WorkflowStep};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Structural errors in a workflow's step graph.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Structural validation failure (empty workflow, duplicate ids, ...).
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A step references an unknown dependency.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

/// A step is ready when every declared dependency has completed.
///
/// A step with no dependencies is always ready.
pub fn step_is_ready(step: &WorkflowStep, completed: &[String]) -> bool {
    step.depends_on.iter().all(|dep| completed.contains(dep))
}

/// Outcome of a cooperative readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyWait {
    /// All dependencies completed.
    Ready,
    /// The execution was cancelled while waiting.
    Cancelled,
}

/// Poll until `step` becomes ready or the execution is cancelled.
///
/// Re-checks readiness every `poll`, yielding between checks. Does not
/// hard-fail on its own: the workflow-level timeout and the cancellation
/// token bound the wait.
pub async fn wait_until_ready(
    step: &WorkflowStep,
    execution: &Arc<RwLock<WorkflowExecution>>,
    poll: Duration,
    cancel: &CancellationToken,
) -> ReadyWait {
    loop {
        {
            let guard = execution.read().await;
            if step_is_ready(step, &guard.completed_steps) {
                return ReadyWait::Ready;
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return ReadyWait::Cancelled,
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Level computation
// ---------------------------------------------------------------------------

/// Partition steps into dependency levels.
///
/// Level `n` contains exactly the steps whose dependencies are fully
/// satisfied by steps in levels `< n`. The algorithm:
///
/// 1. Build a `DiGraph` with step ids as nodes and `depends_on` edges.
/// 2. Run `petgraph::algo::toposort` -- a cycle is a structural error, never
///    an infinite loop.
/// 3. Compute each node's depth (max dependency depth + 1) and group by it.
pub fn compute_levels(steps: &[WorkflowStep]) -> Result<Vec<Vec<String>>, WorkflowError> {
    if steps.is_empty() {
        return Ok(vec![]);
    }

    let id_to_step: HashMap<&str, &WorkflowStep> =
        steps.iter().map(|s| (s.id.as_str(), s)).collect();

    let sorted = toposort_steps(steps)?;

    // Depth per node: roots are depth 0
    let mut depths: HashMap<&str, usize> = HashMap::new();
    for step_id in &sorted {
        let step = id_to_step[step_id.as_str()];
        let depth = step
            .depends_on
            .iter()
            .map(|dep| depths.get(dep.as_str()).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depths.insert(step.id.as_str(), depth);
    }

    let max_depth = depths.values().copied().max().unwrap_or(0);
    let mut levels: Vec<Vec<String>> = vec![vec![]; max_depth + 1];
    for step in steps {
        levels[depths[step.id.as_str()]].push(step.id.clone());
    }

    Ok(levels)
}

/// Topologically sort step ids, surfacing cycles and unknown dependencies.
fn toposort_steps(steps: &[WorkflowStep]) -> Result<Vec<String>, WorkflowError> {
    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    // Edge from dependency -> dependent
    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();

    for step in steps {
        let to_idx = id_to_idx[step.id.as_str()];
        for dep in &step.depends_on {
            let from_idx = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                WorkflowError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ))
            })?;
            graph.add_edge(node_indices[*from_idx], node_indices[to_idx], ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        WorkflowError::CycleDetected(format!("cycle detected involving step '{node_id}'"))
    })?;

    Ok(sorted.into_iter().map(|idx| graph[idx].to_string()).collect())
}

// ---------------------------------------------------------------------------
// Creation-time validation
// ---------------------------------------------------------------------------

/// Validate step structure: unique ids, known dependency references, acyclic
/// graph. A violation here is a creation-time error, never a runtime one.
pub fn validate_steps(steps: &[WorkflowStep]) -> Result<(), WorkflowError> {
    if steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow has no steps".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for step in steps {
        if step.id.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "step id must be non-empty".to_string(),
            ));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
    }

    toposort_steps(steps)?;
    Ok(())
}

/// Validate a full workflow: step structure plus mode-specific metadata
/// (fork-join branches must reference known steps).
pub fn validate_workflow(workflow: &Workflow) -> Result<(), WorkflowError> {
    validate_steps(&workflow.steps)?;

    if let Some(branches) = workflow.branches() {
        let known: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();
        for (name, step_ids) in &branches {
            for step_id in step_ids {
                if !known.contains(step_id.as_str()) {
                    return Err(WorkflowError::ValidationError(format!(
                        "branch '{name}' references unknown step '{step_id}'"
                    )));
                }
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
