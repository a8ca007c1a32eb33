//! Node runner for all six node kinds.
//!
//! `NodeRunner` dispatches one attempt of a node to the behavior of its
//! `NodeKind` and returns the node's result value. Retries, bookkeeping and
//! events are the executor's job; this module only knows how to run a node
//! once.
//!
//! Node kinds: Task, Condition, Loop, Parallel, Delay, SubWorkflow.

use std::time::Duration;

use futures_util::future::{BoxFuture, join_all};
use serde_json::{Value, json};
use stepweave_types::config::EngineConfig;
use stepweave_types::workflow::ExecutionStatus;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::context::NodeContext;
use super::executor::ExecutorError;
use super::node::{NodeKind, WorkflowNode};
use super::state::ExecutionState;

// ---------------------------------------------------------------------------
// NodeError
// ---------------------------------------------------------------------------

/// Errors from a single node attempt.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The node lacks the handler, predicate or target its kind requires.
    #[error("node '{node_id}' has no handler configured")]
    MissingHandler { node_id: String },

    /// A task or loop handler returned an error.
    #[error("handler failed: {0:#}")]
    Handler(#[source] anyhow::Error),

    /// One task of a PARALLEL node failed.
    #[error("parallel task {index} failed: {source:#}")]
    Parallel {
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    /// The attempt ran longer than the node's timeout.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Sub-workflow nesting would exceed the configured maximum.
    #[error("sub-workflow depth {depth} exceeds maximum {max}")]
    DepthExceeded { depth: u32, max: u32 },

    /// The sub-workflow returned an error.
    #[error("sub-workflow '{workflow_id}' failed: {error}")]
    SubWorkflowFailed { workflow_id: String, error: String },

    /// The sub-workflow stopped without completing (paused or cancelled).
    #[error("sub-workflow '{workflow_id}' ended with status {status:?}")]
    SubWorkflowIncomplete {
        workflow_id: String,
        status: ExecutionStatus,
    },
}

impl NodeError {
    /// Whether the retry loop may try again.
    ///
    /// Configuration errors and sub-workflow failures are final: the nested
    /// nodes already spent their own retry budgets.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NodeError::Handler(_) | NodeError::Parallel { .. } | NodeError::Timeout { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Sub-workflow seam
// ---------------------------------------------------------------------------

/// Starts nested executions on behalf of SUB_WORKFLOW nodes.
///
/// Implemented by `WorkflowEngine`; the runner only sees this trait so it can
/// be tested without a registry.
pub trait SubWorkflowLauncher: Send + Sync {
    fn launch(
        &self,
        workflow_id: &str,
        input: Value,
        depth: u32,
        cancellation: CancellationToken,
    ) -> BoxFuture<'static, Result<ExecutionState, ExecutorError>>;
}

// ---------------------------------------------------------------------------
// NodeRunner
// ---------------------------------------------------------------------------

/// Executes individual nodes by dispatching on their kind.
#[derive(Debug, Clone)]
pub struct NodeRunner {
    default_delay_ms: u64,
    max_depth: u32,
}

impl NodeRunner {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            default_delay_ms: config.default_delay_ms,
            max_depth: config.max_sub_workflow_depth,
        }
    }

    /// Run one attempt of `node`, bounded by its timeout when it has one.
    ///
    /// `depth` is the nesting depth of the execution the node belongs to.
    pub async fn run(
        &self,
        node: &WorkflowNode,
        ctx: NodeContext,
        depth: u32,
        launcher: &dyn SubWorkflowLauncher,
    ) -> Result<Value, NodeError> {
        match node.timeout_ms {
            Some(timeout_ms) => tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                self.dispatch(node, ctx, depth, launcher),
            )
            .await
            .map_err(|_| NodeError::Timeout { timeout_ms })?,
            None => self.dispatch(node, ctx, depth, launcher).await,
        }
    }

    async fn dispatch(
        &self,
        node: &WorkflowNode,
        ctx: NodeContext,
        depth: u32,
        launcher: &dyn SubWorkflowLauncher,
    ) -> Result<Value, NodeError> {
        let missing = || NodeError::MissingHandler {
            node_id: node.id.clone(),
        };

        match &node.kind {
            NodeKind::Task { handler } => {
                let handler = handler.as_ref().ok_or_else(missing)?;
                handler(ctx).await.map_err(NodeError::Handler)
            }
            NodeKind::Condition { predicate } => {
                let predicate = predicate.as_ref().ok_or_else(missing)?;
                Ok(Value::Bool(predicate(&ctx)))
            }
            NodeKind::Loop {
                count,
                variable,
                handler,
            } => self.run_loop(*count, variable, handler.as_ref(), &ctx).await,
            NodeKind::Parallel { tasks, .. } => {
                let results = join_all(tasks.iter().map(|task| task())).await;
                let mut values = Vec::with_capacity(results.len());
                for (index, result) in results.into_iter().enumerate() {
                    values.push(result.map_err(|source| NodeError::Parallel { index, source })?);
                }
                Ok(Value::Array(values))
            }
            NodeKind::Delay { delay_ms } => {
                let ms = delay_ms.unwrap_or(self.default_delay_ms);
                tracing::debug!(node_id = %node.id, delay_ms = ms, "delay node sleeping");
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Value::Null)
            }
            NodeKind::SubWorkflow { workflow_id } => {
                let workflow_id = workflow_id.as_deref().ok_or_else(missing)?;
                self.run_sub_workflow(workflow_id, &ctx, depth, launcher)
                    .await
            }
        }
    }

    async fn run_loop(
        &self,
        count: u32,
        variable: &str,
        handler: Option<&super::node::TaskHandler>,
        ctx: &NodeContext,
    ) -> Result<Value, NodeError> {
        let mut results = Vec::with_capacity(count as usize);
        for i in 0..count {
            ctx.set_variable(variable, json!(i));
            let value = match handler {
                Some(handler) => handler(ctx.for_iteration(i))
                    .await
                    .map_err(NodeError::Handler)?,
                None => Value::Null,
            };
            results.push(value);
        }
        Ok(Value::Array(results))
    }

    async fn run_sub_workflow(
        &self,
        workflow_id: &str,
        ctx: &NodeContext,
        depth: u32,
        launcher: &dyn SubWorkflowLauncher,
    ) -> Result<Value, NodeError> {
        let child_depth = depth + 1;
        if child_depth > self.max_depth {
            return Err(NodeError::DepthExceeded {
                depth: child_depth,
                max: self.max_depth,
            });
        }

        tracing::debug!(
            node_id = %ctx.node_id,
            sub_workflow = workflow_id,
            depth = child_depth,
            "starting sub-workflow"
        );

        let state = launcher
            .launch(
                workflow_id,
                ctx.input(),
                child_depth,
                ctx.cancellation.child_token(),
            )
            .await
            .map_err(|e| NodeError::SubWorkflowFailed {
                workflow_id: workflow_id.to_string(),
                error: e.to_string(),
            })?;

        if state.status != ExecutionStatus::Completed {
            return Err(NodeError::SubWorkflowIncomplete {
                workflow_id: workflow_id.to_string(),
                status: state.status,
            });
        }

        Ok(state.context.output_value())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
