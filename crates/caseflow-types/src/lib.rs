//! Shared domain types for Caseflow.
//!
//! This crate holds the serde-serializable data model shared by the engine
//! and its consumers: workflow and step definitions, execution tracking
//! types, the job-service wire types, and engine lifecycle events. It has no
//! IO and never depends on the engine crate.

pub mod event;
pub mod job;
pub mod workflow;
