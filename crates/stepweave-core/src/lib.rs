//! Dependency-driven workflow execution engine.
//!
//! Build a [`Workflow`] of typed nodes, register it with a [`WorkflowEngine`]
//! and execute it. The engine schedules nodes as their dependencies complete,
//! runs ready nodes in bounded concurrent batches, retries failures with
//! backoff, and keeps a queryable trace of every execution.
//!
//! Serializable types (definitions, statuses, config, events) live in
//! `stepweave-types`; this crate holds the runtime.

pub mod config;
pub mod event;
pub mod workflow;

pub use workflow::{
    ExecutionState, ExecutorError, NodeContext, Workflow, WorkflowEngine, WorkflowError,
    WorkflowNode,
};
