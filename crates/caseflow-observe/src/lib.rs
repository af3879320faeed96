//! Observability setup for Caseflow.

pub mod tracing_setup;
