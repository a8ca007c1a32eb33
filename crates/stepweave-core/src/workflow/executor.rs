//! Workflow engine and its frontier scheduler.
//!
//! `WorkflowEngine` owns the workflow and execution registries. Each
//! execution is advanced by a single scheduler loop: it picks up to
//! `concurrency_limit` ready nodes from the frontier, runs them concurrently
//! via `tokio::JoinSet`, waits for every member of the batch to settle, then
//! recomputes the frontier. The loop stops when the frontier drains, when a
//! node fails past its retry budget (fail-fast), or when the execution is
//! paused or cancelled.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::BoxFuture;
use serde_json::Value;
use stepweave_types::config::{ConditionBranching, EngineConfig, FailurePolicy};
use stepweave_types::event::EngineEvent;
use stepweave_types::workflow::{ExecutionStatus, NodeExecution};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::context::{ContextHandle, NodeContext, WorkflowContext};
use super::dag::{self, GraphAnalysis};
use super::definition::{self, WorkflowError};
use super::node::{NodeKind, Workflow, WorkflowNode};
use super::node_runner::{NodeRunner, SubWorkflowLauncher};
use super::retry::{RetryPolicy, retry_with_backoff};
use super::state::{ExecutionRecord, ExecutionState, RunState};
use crate::event::EventBus;

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Errors returned by the engine's public operations.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Workflow-level error (validation, cycle, parse).
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    /// A caller-supplied execution id is already in the registry.
    #[error("execution already exists: {0}")]
    DuplicateExecution(String),

    /// A node failed past its retry budget.
    #[error("node '{node_id}' failed after {retries} retries: {error}")]
    NodeFailed {
        node_id: String,
        error: String,
        retries: u32,
    },

    /// No frontier node can ever become ready.
    #[error("execution '{execution_id}' stalled with unrunnable nodes {nodes:?}")]
    Stalled {
        execution_id: String,
        nodes: Vec<String>,
    },

    /// Lifecycle operation not allowed in the execution's current state.
    #[error("execution '{execution_id}' cannot be {action}: {reason}")]
    InvalidState {
        execution_id: String,
        action: &'static str,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

pub(crate) struct EngineInner {
    pub config: EngineConfig,
    pub workflows: DashMap<String, Arc<Workflow>>,
    pub executions: DashMap<String, Arc<ExecutionRecord>>,
    pub runner: NodeRunner,
    pub events: EventBus,
}

/// Registry and scheduler for workflows and their executions.
///
/// Cloning is cheap; every clone shares the same registries and event bus.
#[derive(Clone)]
pub struct WorkflowEngine {
    pub(crate) inner: Arc<EngineInner>,
}

/// How one spawned node task ended.
enum NodeOutcome {
    Completed { node_id: String, value: Value },
    Failed {
        node_id: String,
        error: String,
        retries: u32,
    },
}

/// What the loop's exit means for the execution as a whole.
enum Ending {
    Cancelled,
    Paused,
    Completed,
    Failed {
        error: ExecutorError,
        skipped: Vec<String>,
    },
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig) -> Self {
        let config = config.sanitized();
        Self {
            inner: Arc::new(EngineInner {
                runner: NodeRunner::new(&config),
                events: EventBus::new(config.event_capacity),
                workflows: DashMap::new(),
                executions: DashMap::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Receiver for engine events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    // -- Workflow registry --------------------------------------------------

    /// Register a workflow, replacing any previous one with the same id.
    /// Validation happens when an execution starts.
    pub fn register_workflow(&self, workflow: Workflow) -> Arc<Workflow> {
        let workflow = Arc::new(workflow);
        let replaced = self
            .inner
            .workflows
            .insert(workflow.id.clone(), Arc::clone(&workflow))
            .is_some();
        tracing::info!(
            workflow_id = %workflow.id,
            nodes = workflow.nodes.len(),
            replaced,
            "workflow registered"
        );
        workflow
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        self.inner
            .workflows
            .get(workflow_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// All registered workflows, sorted by id.
    pub fn list_workflows(&self) -> Vec<Arc<Workflow>> {
        let mut workflows: Vec<_> = self
            .inner
            .workflows
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        workflows
    }

    pub fn unregister_workflow(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        self.inner
            .workflows
            .remove(workflow_id)
            .map(|(_, workflow)| workflow)
    }

    /// Serialize a registered workflow to JSON. Handlers are dropped.
    pub fn export_workflow(&self, workflow_id: &str) -> Result<String, ExecutorError> {
        let workflow = self.require_workflow(workflow_id)?;
        Ok(definition::serialize_workflow_json(&workflow)?)
    }

    /// Parse exported JSON and register the result.
    ///
    /// The imported workflow has no handlers. To run it, re-attach them on a
    /// parsed `Workflow` (see `parse_workflow_json`) and register that instead.
    pub fn import_workflow(&self, json: &str) -> Result<Arc<Workflow>, ExecutorError> {
        let workflow = definition::parse_workflow_json(json)?;
        Ok(self.register_workflow(workflow))
    }

    /// Ordering, levels and critical path of a registered workflow.
    pub fn analyze_workflow(&self, workflow_id: &str) -> Result<GraphAnalysis, ExecutorError> {
        let workflow = self.require_workflow(workflow_id)?;
        Ok(dag::analyze(&workflow)?)
    }

    fn require_workflow(&self, workflow_id: &str) -> Result<Arc<Workflow>, ExecutorError> {
        self.get_workflow(workflow_id)
            .ok_or_else(|| ExecutorError::WorkflowNotFound(workflow_id.to_string()))
    }

    // -- Execution ----------------------------------------------------------

    /// Run a registered workflow under a fresh execution id.
    ///
    /// Resolves once the execution completes, is paused, or is cancelled, and
    /// returns a snapshot of its state. A failed run returns `Err`; its FAILED
    /// state stays queryable through `get_execution_status`.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        input: Value,
    ) -> Result<ExecutionState, ExecutorError> {
        self.start_execution(workflow_id, input, None, 0, CancellationToken::new())
            .await
    }

    /// Like [`WorkflowEngine::execute_workflow`] with a caller-chosen id, so
    /// the execution can be paused or cancelled from elsewhere while it runs.
    pub async fn execute_workflow_with_id(
        &self,
        workflow_id: &str,
        input: Value,
        execution_id: impl Into<String>,
    ) -> Result<ExecutionState, ExecutorError> {
        self.start_execution(
            workflow_id,
            input,
            Some(execution_id.into()),
            0,
            CancellationToken::new(),
        )
        .await
    }

    async fn start_execution(
        &self,
        workflow_id: &str,
        input: Value,
        execution_id: Option<String>,
        depth: u32,
        cancellation: CancellationToken,
    ) -> Result<ExecutionState, ExecutorError> {
        let workflow = self.require_workflow(workflow_id)?;
        let execution_id = execution_id.unwrap_or_else(|| Uuid::now_v7().to_string());

        let variables = workflow
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let context =
            WorkflowContext::new(workflow.id.clone(), execution_id.clone(), input, variables);
        let record = Arc::new(ExecutionRecord::new(
            Arc::clone(&workflow),
            ContextHandle::new(context),
            cancellation,
            depth,
        ));

        match self.inner.executions.entry(execution_id.clone()) {
            Entry::Occupied(_) => return Err(ExecutorError::DuplicateExecution(execution_id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&record));
            }
        }

        let span = tracing::info_span!(
            "workflow_execution",
            execution_id = %execution_id,
            workflow_id = %workflow.id,
            depth,
        );

        async move {
            tracing::info!(nodes = workflow.nodes.len(), "workflow execution started");
            self.inner.events.publish(EngineEvent::ExecutionStarted {
                execution_id: execution_id.clone(),
                workflow_id: workflow.id.clone(),
                depth,
            });

            if let Err(err) = definition::ensure_executable(&workflow) {
                let err = ExecutorError::from(err);
                record.with_state(|state| {
                    state.finish(ExecutionStatus::Failed, Some(err.to_string()))
                });
                self.publish_failed(&record, &err);
                return Err(err);
            }

            self.drive(&record).await
        }
        .instrument(span)
        .await
    }

    /// Advance an execution until its loop exits, then settle its status.
    ///
    /// Holds the record's driver lock for the whole run, so a resume issued
    /// while an earlier loop is still unwinding waits for it.
    pub(crate) async fn drive(
        &self,
        record: &Arc<ExecutionRecord>,
    ) -> Result<ExecutionState, ExecutorError> {
        let _driver = record.driver.lock().await;

        let idle = record.with_state(|s| s.status.is_terminal() || s.is_paused || s.is_cancelled);
        if idle {
            return Ok(record.snapshot());
        }

        let outcome = self.run_scheduler(record).await;
        self.finalize(record, outcome)
    }

    async fn run_scheduler(&self, record: &Arc<ExecutionRecord>) -> Result<(), ExecutorError> {
        let workflow = Arc::clone(&record.workflow);
        let limit = self.inner.config.concurrency_limit;

        loop {
            // A parent execution was cancelled while this one ran nested
            if record.cancellation.is_cancelled() {
                self.cancel_record(record);
            }

            let batch: Vec<String> = {
                let mut state = record.lock_state();
                if state.current_nodes.is_empty() || state.is_paused || state.is_cancelled {
                    return Ok(());
                }

                let mut ready = ready_nodes(&workflow, &state);
                if ready.is_empty() && state.advance_frontier(&workflow) > 0 {
                    ready = ready_nodes(&workflow, &state);
                }
                if ready.is_empty() {
                    if frontier_blocked(&workflow, &state) {
                        return Ok(());
                    }
                    return Err(ExecutorError::Stalled {
                        execution_id: record.execution_id.clone(),
                        nodes: state.current_nodes.clone(),
                    });
                }
                ready.truncate(limit);
                ready
            };

            tracing::debug!(batch = ?batch, "running batch");

            let mut join_set = JoinSet::new();
            let mut task_nodes = HashMap::new();
            for node_id in &batch {
                let Some(node) = workflow.node(node_id).cloned() else {
                    continue;
                };
                let engine = self.clone();
                let record = Arc::clone(record);
                let handle = join_set.spawn(engine.run_node(record, node).in_current_span());
                task_nodes.insert(handle.id(), node_id.clone());
            }

            let mut first_failure: Option<ExecutorError> = None;
            while let Some(joined) = join_set.join_next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(join_err) => {
                        let node_id = task_nodes.get(&join_err.id()).cloned().unwrap_or_default();
                        self.record_panic(record, node_id, &join_err)
                    }
                };

                match outcome {
                    NodeOutcome::Completed { node_id, value } => {
                        self.apply_condition(record, &node_id, &value);
                    }
                    NodeOutcome::Failed {
                        node_id,
                        error,
                        retries,
                    } => {
                        if self.inner.config.failure_policy == FailurePolicy::FailFast
                            && first_failure.is_none()
                        {
                            first_failure = Some(ExecutorError::NodeFailed {
                                node_id,
                                error,
                                retries,
                            });
                        }
                    }
                }
            }

            let failed = first_failure.is_some();
            record.with_state(|state| {
                state.current_nodes.retain(|id| !batch.contains(id));
                if !failed {
                    state.advance_frontier(&workflow);
                }
            });

            if let Some(err) = first_failure {
                return Err(err);
            }
        }
    }

    /// Run one node with retries and record the result. Spawned per batch
    /// member.
    async fn run_node(self, record: Arc<ExecutionRecord>, node: WorkflowNode) -> NodeOutcome {
        let node_id = node.id.clone();
        let execution_id = record.execution_id.clone();

        record.with_state(|state| {
            state
                .node_executions
                .insert(node_id.clone(), NodeExecution::start(&node_id));
        });
        record.context.set_current_node(&node_id);
        self.inner.events.publish(EngineEvent::NodeStarted {
            execution_id: execution_id.clone(),
            node_id: node_id.clone(),
            node_name: node.name.clone(),
            node_type: node.node_type().as_str().to_string(),
        });
        tracing::debug!(node_id = %node_id, node_type = %node.node_type(), "node started");

        let policy = RetryPolicy::for_node(&self.inner.config, node.max_retries);
        let node_ctx = NodeContext::new(
            node_id.clone(),
            record.context.clone(),
            record.cancellation.clone(),
        );
        let runner = &self.inner.runner;
        let launcher: &dyn SubWorkflowLauncher = &self;

        let outcome = retry_with_backoff(
            &policy,
            |_attempt| runner.run(&node, node_ctx.clone(), record.depth, launcher),
            |attempt, error, will_retry| {
                tracing::warn!(
                    node_id = %node_id,
                    attempt,
                    will_retry,
                    error = %error,
                    "node attempt failed"
                );
                if will_retry {
                    record.with_state(|state| {
                        if let Some(exec) = state.node_executions.get_mut(&node_id) {
                            exec.retry_count += 1;
                        }
                    });
                }
                self.inner.events.publish(EngineEvent::NodeFailed {
                    execution_id: execution_id.clone(),
                    node_id: node_id.clone(),
                    error: error.to_string(),
                    attempt,
                    will_retry,
                });
            },
        )
        .await;

        let retries = outcome.retries;
        match outcome.result {
            Ok(value) => {
                record.context.set_output(&node_id, value.clone());
                let duration_ms = record.with_state(|state| {
                    state.completed_nodes.push(node_id.clone());
                    state
                        .node_executions
                        .get_mut(&node_id)
                        .map(|exec| {
                            exec.retry_count = retries;
                            exec.complete(value.clone());
                            exec.duration_ms.unwrap_or(0)
                        })
                        .unwrap_or(0)
                });
                tracing::info!(node_id = %node_id, duration_ms, retries, "node completed");
                self.inner.events.publish(EngineEvent::NodeCompleted {
                    execution_id,
                    node_id: node_id.clone(),
                    duration_ms,
                    retry_count: retries,
                });
                NodeOutcome::Completed { node_id, value }
            }
            Err(error) => {
                let message = error.to_string();
                record.with_state(|state| {
                    state.failed_nodes.push(node_id.clone());
                    if let Some(exec) = state.node_executions.get_mut(&node_id) {
                        exec.retry_count = retries;
                        exec.fail(message.clone());
                    }
                });
                tracing::error!(node_id = %node_id, retries, error = %message, "node failed");
                NodeOutcome::Failed {
                    node_id,
                    error: message,
                    retries,
                }
            }
        }
    }

    /// A node task panicked; record it as a failed node.
    fn record_panic(
        &self,
        record: &ExecutionRecord,
        node_id: String,
        join_err: &tokio::task::JoinError,
    ) -> NodeOutcome {
        let message = format!("node task panicked: {join_err}");
        record.with_state(|state| {
            state.failed_nodes.push(node_id.clone());
            let exec = state
                .node_executions
                .entry(node_id.clone())
                .or_insert_with(|| NodeExecution::start(&node_id));
            exec.fail(message.clone());
        });
        tracing::error!(node_id = %node_id, error = %message, "node task panicked");
        NodeOutcome::Failed {
            node_id,
            error: message,
            retries: 0,
        }
    }

    /// Under `SkipDescendants`, a condition that returned false prunes every
    /// transitive dependent.
    fn apply_condition(&self, record: &ExecutionRecord, node_id: &str, value: &Value) {
        if self.inner.config.condition_branching != ConditionBranching::SkipDescendants {
            return;
        }
        let is_false_condition = matches!(
            record.workflow.node(node_id).map(|n| &n.kind),
            Some(NodeKind::Condition { .. })
        ) && value == &Value::Bool(false);
        if !is_false_condition {
            return;
        }

        let mut dependents = dag::get_node_dependents(node_id, &record.workflow);
        dependents.sort_unstable();
        let skipped: Vec<String> = record.with_state(|state| {
            dependents
                .into_iter()
                .filter(|id| state.skip(id))
                .map(str::to_string)
                .collect()
        });

        let reason = format!("condition '{node_id}' evaluated to false");
        for id in skipped {
            tracing::debug!(node_id = %id, condition = node_id, "node skipped");
            self.publish_skipped(record, id, reason.clone());
        }
    }

    /// Turn the loop's exit into the execution's final (or paused) status.
    fn finalize(
        &self,
        record: &Arc<ExecutionRecord>,
        outcome: Result<(), ExecutorError>,
    ) -> Result<ExecutionState, ExecutorError> {
        let ending = record.with_state(|state| {
            if state.is_cancelled {
                return Ending::Cancelled;
            }
            match outcome {
                Err(error) => {
                    state.finish(ExecutionStatus::Failed, Some(error.to_string()));
                    Ending::Failed {
                        error,
                        skipped: Vec::new(),
                    }
                }
                Ok(()) if state.is_paused => Ending::Paused,
                Ok(()) => match first_failure(state) {
                    Some(error) => {
                        let skipped: Vec<String> = state
                            .unreached(&record.workflow)
                            .into_iter()
                            .filter(|id| state.skip(id))
                            .collect();
                        state.finish(ExecutionStatus::Failed, Some(error.to_string()));
                        Ending::Failed { error, skipped }
                    }
                    None => {
                        state.finish(ExecutionStatus::Completed, None);
                        Ending::Completed
                    }
                },
            }
        });

        match ending {
            Ending::Cancelled => {
                tracing::info!("execution loop stopped after cancellation");
                Ok(record.snapshot())
            }
            Ending::Paused => {
                tracing::info!("execution paused");
                Ok(record.snapshot())
            }
            Ending::Completed => {
                let snapshot = record.snapshot();
                let duration_ms = snapshot.duration_ms.unwrap_or(0);
                let nodes_completed = snapshot.completed_nodes.len() as u32;
                tracing::info!(duration_ms, nodes_completed, "workflow execution completed");
                self.inner.events.publish(EngineEvent::ExecutionCompleted {
                    execution_id: snapshot.execution_id.clone(),
                    workflow_id: snapshot.workflow_id.clone(),
                    duration_ms,
                    nodes_completed,
                });
                Ok(snapshot)
            }
            Ending::Failed { error, skipped } => {
                for id in skipped {
                    self.publish_skipped(record, id, "blocked by failed dependency".to_string());
                }
                self.publish_failed(record, &error);
                Err(error)
            }
        }
    }

    /// Mark an unfinished execution CANCELLED, fire its token and publish the
    /// event. Returns false if it had already finished or been cancelled.
    pub(crate) fn cancel_record(&self, record: &ExecutionRecord) -> bool {
        let newly_cancelled = record.with_state(|state| {
            if state.is_cancelled || state.status.is_terminal() {
                return false;
            }
            state.is_cancelled = true;
            state.finish(ExecutionStatus::Cancelled, None);
            true
        });
        if newly_cancelled {
            record.cancellation.cancel();
            tracing::info!(execution_id = %record.execution_id, "execution cancelled");
            self.inner.events.publish(EngineEvent::ExecutionCancelled {
                execution_id: record.execution_id.clone(),
            });
        }
        newly_cancelled
    }

    fn publish_failed(&self, record: &ExecutionRecord, error: &ExecutorError) {
        tracing::error!(error = %error, "workflow execution failed");
        self.inner.events.publish(EngineEvent::ExecutionFailed {
            execution_id: record.execution_id.clone(),
            workflow_id: record.workflow.id.clone(),
            error: error.to_string(),
        });
    }

    fn publish_skipped(&self, record: &ExecutionRecord, node_id: String, reason: String) {
        self.inner.events.publish(EngineEvent::NodeSkipped {
            execution_id: record.execution_id.clone(),
            node_id,
            reason,
        });
    }
}

impl SubWorkflowLauncher for WorkflowEngine {
    fn launch(
        &self,
        workflow_id: &str,
        input: Value,
        depth: u32,
        cancellation: CancellationToken,
    ) -> BoxFuture<'static, Result<ExecutionState, ExecutorError>> {
        let engine = self.clone();
        let workflow_id = workflow_id.to_string();
        Box::pin(async move {
            engine
                .start_execution(&workflow_id, input, None, depth, cancellation)
                .await
        })
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflows", &self.inner.workflows.len())
            .field("executions", &self.inner.executions.len())
            .field("events", &self.inner.events)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Frontier helpers
// ---------------------------------------------------------------------------

/// Frontier members whose dependencies have all completed.
fn ready_nodes(workflow: &Workflow, state: &RunState) -> Vec<String> {
    state
        .current_nodes
        .iter()
        .filter(|id| {
            workflow.node(id).is_some_and(|node| {
                node.dependencies
                    .iter()
                    .all(|dep| state.completed_nodes.contains(dep))
            })
        })
        .cloned()
        .collect()
}

/// Whether every frontier member waits on a failed node.
fn frontier_blocked(workflow: &Workflow, state: &RunState) -> bool {
    state.current_nodes.iter().all(|id| {
        workflow.node(id).is_some_and(|node| {
            node.dependencies
                .iter()
                .any(|dep| state.failed_nodes.contains(dep))
        })
    })
}

/// Error describing the first node that failed under the continue policy.
fn first_failure(state: &RunState) -> Option<ExecutorError> {
    let node_id = state.failed_nodes.first()?;
    let exec = state.node_executions.get(node_id);
    Some(ExecutorError::NodeFailed {
        node_id: node_id.clone(),
        error: exec.and_then(|e| e.error.clone()).unwrap_or_default(),
        retries: exec.map(|e| e.retry_count).unwrap_or(0),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
