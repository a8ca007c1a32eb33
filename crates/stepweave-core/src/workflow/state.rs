//! Execution state: the public snapshot handed to callers and the internal
//! record the scheduler mutates.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stepweave_types::workflow::{ExecutionStatus, NodeExecution};
use tokio_util::sync::CancellationToken;

use super::context::{ContextHandle, WorkflowContext};
use super::node::Workflow;

// ---------------------------------------------------------------------------
// ExecutionState (snapshot)
// ---------------------------------------------------------------------------

/// Point-in-time view of one execution.
///
/// Returned by `execute_workflow`, `get_execution_status` and friends. It is
/// a detached copy: later progress is not reflected in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub workflow_id: String,
    pub execution_id: String,
    pub status: ExecutionStatus,
    /// Frontier: nodes that are candidates for the next batch.
    pub current_nodes: Vec<String>,
    /// In completion order.
    pub completed_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
    pub skipped_nodes: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub context: WorkflowContext,
    pub node_executions: HashMap<String, NodeExecution>,
    pub is_paused: bool,
    pub is_cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Sub-workflow nesting depth; 0 for top-level executions.
    #[serde(default)]
    pub depth: u32,
}

impl ExecutionState {
    /// A RUNNING state started now, with an empty frontier.
    pub fn new(context: WorkflowContext, depth: u32) -> Self {
        Self {
            workflow_id: context.workflow_id.clone(),
            execution_id: context.execution_id.clone(),
            status: ExecutionStatus::Running,
            current_nodes: Vec::new(),
            completed_nodes: Vec::new(),
            failed_nodes: Vec::new(),
            skipped_nodes: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            context,
            node_executions: HashMap::new(),
            is_paused: false,
            is_cancelled: false,
            error: None,
            depth,
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeExecution> {
        self.node_executions.get(node_id)
    }
}

// ---------------------------------------------------------------------------
// RunState (scheduler-owned)
// ---------------------------------------------------------------------------

/// Mutable scheduling state of an execution, everything but the context.
#[derive(Debug)]
pub(crate) struct RunState {
    pub status: ExecutionStatus,
    pub current_nodes: Vec<String>,
    pub completed_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
    pub skipped_nodes: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub node_executions: HashMap<String, NodeExecution>,
    pub is_paused: bool,
    pub is_cancelled: bool,
    pub error: Option<String>,
}

impl RunState {
    fn new(start_node_id: &str) -> Self {
        Self {
            status: ExecutionStatus::Running,
            current_nodes: vec![start_node_id.to_string()],
            completed_nodes: Vec::new(),
            failed_nodes: Vec::new(),
            skipped_nodes: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            node_executions: HashMap::new(),
            is_paused: false,
            is_cancelled: false,
            error: None,
        }
    }

    /// Move to a terminal status and stamp the end time.
    pub fn finish(&mut self, status: ExecutionStatus, error: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.ended_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        if error.is_some() {
            self.error = error;
        }
    }

    /// Whether the node has settled or was pruned.
    pub fn is_settled(&self, node_id: &str) -> bool {
        self.completed_nodes.iter().any(|n| n == node_id)
            || self.failed_nodes.iter().any(|n| n == node_id)
            || self.skipped_nodes.iter().any(|n| n == node_id)
    }

    /// Record a node as SKIPPED and drop it from the frontier. Returns false
    /// if the node had already settled.
    pub fn skip(&mut self, node_id: &str) -> bool {
        if self.is_settled(node_id) {
            return false;
        }
        self.current_nodes.retain(|n| n != node_id);
        self.skipped_nodes.push(node_id.to_string());
        self.node_executions
            .insert(node_id.to_string(), NodeExecution::skipped(node_id));
        true
    }

    /// Append every unscheduled node whose dependencies are all completed.
    /// Returns how many nodes joined the frontier.
    pub fn advance_frontier(&mut self, workflow: &Workflow) -> usize {
        let completed: HashSet<&str> = self.completed_nodes.iter().map(String::as_str).collect();
        let mut added = Vec::new();
        for (id, node) in &workflow.nodes {
            if self.is_settled(id) || self.current_nodes.contains(id) {
                continue;
            }
            if node
                .dependencies
                .iter()
                .all(|dep| completed.contains(dep.as_str()))
            {
                added.push(id.clone());
            }
        }
        let count = added.len();
        self.current_nodes.extend(added);
        count
    }

    /// Nodes that never ran, other than those already settled.
    pub fn unreached(&self, workflow: &Workflow) -> Vec<String> {
        workflow
            .nodes
            .keys()
            .filter(|id| !self.is_settled(id))
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// ExecutionRecord
// ---------------------------------------------------------------------------

/// Registry entry for one execution.
///
/// `driver` is held by whichever scheduler loop is currently advancing the
/// execution, so a resume waits for a loop that has not yet seen the pause.
pub(crate) struct ExecutionRecord {
    pub workflow: Arc<Workflow>,
    pub context: ContextHandle,
    pub cancellation: CancellationToken,
    pub depth: u32,
    pub execution_id: String,
    state: Mutex<RunState>,
    pub driver: tokio::sync::Mutex<()>,
}

impl ExecutionRecord {
    pub fn new(
        workflow: Arc<Workflow>,
        context: ContextHandle,
        cancellation: CancellationToken,
        depth: u32,
    ) -> Self {
        let execution_id = context.execution_id();
        let state = RunState::new(&workflow.start_node_id);
        Self {
            workflow,
            context,
            cancellation,
            depth,
            execution_id,
            state: Mutex::new(state),
            driver: tokio::sync::Mutex::new(()),
        }
    }

    pub fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().expect("execution state lock poisoned")
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut RunState) -> R) -> R {
        f(&mut self.lock_state())
    }

    pub fn snapshot(&self) -> ExecutionState {
        let context = self.context.snapshot();
        let state = self.lock_state();
        ExecutionState {
            workflow_id: self.workflow.id.clone(),
            execution_id: self.execution_id.clone(),
            status: state.status,
            current_nodes: state.current_nodes.clone(),
            completed_nodes: state.completed_nodes.clone(),
            failed_nodes: state.failed_nodes.clone(),
            skipped_nodes: state.skipped_nodes.clone(),
            started_at: state.started_at,
            ended_at: state.ended_at,
            duration_ms: state.duration_ms,
            context,
            node_executions: state.node_executions.clone(),
            is_paused: state.is_paused,
            is_cancelled: state.is_cancelled,
            error: state.error.clone(),
            depth: self.depth,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
