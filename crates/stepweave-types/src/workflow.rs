//! Workflow domain types for stepweave.
//!
//! Defines the serializable shape of a workflow graph (`WorkflowDefinition`,
//! `NodeDefinition`) used for export/import, plus the execution tracking
//! types (`ExecutionStatus`, `NodeExecution`) shared by the engine and any
//! consumer that renders execution traces.
//!
//! Handlers and predicates are runtime closures and never appear here; the
//! engine crate attaches them on top of these definitions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow Definition (export/import IR)
// ---------------------------------------------------------------------------

/// Serializable form of a workflow graph.
///
/// This is what `export_workflow` emits and `import_workflow` parses. Node
/// handlers are dropped on export and must be re-attached by node id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Caller-assigned workflow id. Unique within one engine.
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Version string (e.g. "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// Node the scheduler seeds the frontier with.
    pub start_node_id: String,
    /// Nodes keyed by node id.
    pub nodes: BTreeMap<String, NodeDefinition>,
    /// Initial context variables for every execution.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,
    /// Extensible metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

// ---------------------------------------------------------------------------
// Node Definition
// ---------------------------------------------------------------------------

/// A single node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Node id, unique within a workflow.
    pub id: String,
    /// Human-readable node name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Node ids that must reach COMPLETED before this node may start.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Per-node retry budget (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Per-attempt timeout in milliseconds. None means no timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Kind-specific parameters.
    pub config: NodeConfig,
}

/// The kind of a workflow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Task,
    Condition,
    Loop,
    Parallel,
    Delay,
    SubWorkflow,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Task => "task",
            NodeType::Condition => "condition",
            NodeType::Loop => "loop",
            NodeType::Parallel => "parallel",
            NodeType::Delay => "delay",
            NodeType::SubWorkflow => "sub_workflow",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific node parameters, internally tagged by `type`:
///
/// ```json
/// { "type": "loop", "loop_count": 3, "loop_variable": "i" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeConfig {
    /// Invoke a caller-supplied async handler.
    Task,
    /// Evaluate a caller-supplied boolean predicate.
    Condition,
    /// Repeat the handler `loop_count` times, exposing the index as `loop_variable`.
    Loop { loop_count: u32, loop_variable: String },
    /// Fan out a list of async tasks. Only the count survives serialization.
    Parallel {
        #[serde(default)]
        task_count: usize,
    },
    /// Suspend for `delay_ms` milliseconds (engine default when absent).
    Delay {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay_ms: Option<u64>,
    },
    /// Run another registered workflow to completion.
    SubWorkflow {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sub_workflow_id: Option<String>,
    },
}

impl NodeConfig {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeConfig::Task => NodeType::Task,
            NodeConfig::Condition => NodeType::Condition,
            NodeConfig::Loop { .. } => NodeType::Loop,
            NodeConfig::Parallel { .. } => NodeType::Parallel,
            NodeConfig::Delay { .. } => NodeType::Delay,
            NodeConfig::SubWorkflow { .. } => NodeType::SubWorkflow,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Outcome of a static workflow check. `valid` is true iff `errors` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution Status
// ---------------------------------------------------------------------------

/// Status shared by executions and individual node executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl ExecutionStatus {
    /// Whether no further transitions are expected.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Skipped
                | ExecutionStatus::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// Node Execution record
// ---------------------------------------------------------------------------

/// Run record for a single node within one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub node_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of retries performed (0 when the first attempt settled it).
    #[serde(default)]
    pub retry_count: u32,
}

impl NodeExecution {
    /// A fresh record in RUNNING state, stamped now.
    pub fn start(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: ExecutionStatus::Running,
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_ms: None,
            result: None,
            error: None,
            retry_count: 0,
        }
    }

    /// A record for a node that was never attempted.
    pub fn skipped(node_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            node_id: node_id.into(),
            status: ExecutionStatus::Skipped,
            started_at: None,
            completed_at: Some(now),
            duration_ms: None,
            result: None,
            error: None,
            retry_count: 0,
        }
    }

    pub fn complete(&mut self, result: Value) {
        self.finish(ExecutionStatus::Completed);
        self.result = Some(result);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.finish(ExecutionStatus::Failed);
        self.error = Some(error.into());
    }

    fn finish(&mut self, status: ExecutionStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|start| (now - start).num_milliseconds().max(0) as u64);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_config_tagged_by_type() {
        let config = NodeConfig::Loop {
            loop_count: 3,
            loop_variable: "i".to_string(),
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["type"], "loop");
        assert_eq!(json["loop_count"], 3);

        let task: NodeConfig = serde_json::from_value(json!({ "type": "task" })).unwrap();
        assert_eq!(task, NodeConfig::Task);
        assert_eq!(task.node_type(), NodeType::Task);
    }

    #[test]
    fn delay_without_ms_deserializes() {
        let config: NodeConfig = serde_json::from_value(json!({ "type": "delay" })).unwrap();
        assert_eq!(config, NodeConfig::Delay { delay_ms: None });
    }

    #[test]
    fn definition_defaults_version_and_maps() {
        let def: WorkflowDefinition = serde_json::from_value(json!({
            "id": "wf",
            "name": "Workflow",
            "start_node_id": "a",
            "nodes": {
                "a": { "id": "a", "name": "A", "config": { "type": "task" } }
            }
        }))
        .unwrap();
        assert_eq!(def.version, "1.0.0");
        assert!(def.variables.is_empty());
        assert!(def.nodes["a"].dependencies.is_empty());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Skipped.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn node_execution_lifecycle() {
        let mut exec = NodeExecution::start("a");
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert!(exec.started_at.is_some());

        exec.complete(json!(42));
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.result, Some(json!(42)));
        assert!(exec.completed_at.is_some());
        assert!(exec.duration_ms.is_some());
    }

    #[test]
    fn node_execution_failure_records_error() {
        let mut exec = NodeExecution::start("a");
        exec.retry_count = 2;
        exec.fail("boom");
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.error.as_deref(), Some("boom"));
        assert_eq!(exec.retry_count, 2);
    }

    #[test]
    fn validation_report_validity_follows_errors() {
        assert!(ValidationReport::from_errors(vec![]).valid);
        assert!(!ValidationReport::from_errors(vec!["x".to_string()]).valid);
    }
}
