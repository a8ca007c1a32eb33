//! Workflow engine: graph model, validation, scheduling and lifecycle.
//!
//! - `node` -- in-memory workflow graph, node kinds and handler seams
//! - `definition` -- validation and JSON export/import
//! - `dag` -- ordering, cycle detection, levels and critical path
//! - `context` -- shared execution context handed to handlers
//! - `retry` -- bounded retry with linear or exponential backoff
//! - `node_runner` -- per-kind node execution
//! - `state` -- execution snapshots and records
//! - `executor` -- `WorkflowEngine` and the frontier scheduler
//! - `lifecycle` -- pause/resume/cancel and registry housekeeping

pub mod context;
pub mod dag;
pub mod definition;
pub mod executor;
mod lifecycle;
pub mod node;
pub mod node_runner;
pub mod retry;
pub mod state;

pub use context::{ContextHandle, NodeContext, WorkflowContext};
pub use definition::{WorkflowError, validate_workflow};
pub use executor::{ExecutorError, WorkflowEngine};
pub use node::{
    ConditionFn, ParallelTask, TaskHandler, Workflow, WorkflowNode, condition_fn, parallel_task,
    task_handler,
};
pub use state::ExecutionState;
