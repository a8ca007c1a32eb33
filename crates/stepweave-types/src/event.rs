//! Event types for the workflow engine event bus.
//!
//! `EngineEvent` is broadcast while executions progress. Every variant is
//! Clone + Send + Sync for use with tokio broadcast channels, and serializes
//! with a `type` tag so subscribers can forward events as JSON.

use serde::{Deserialize, Serialize};

/// Events emitted during workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// An execution has started.
    ExecutionStarted {
        execution_id: String,
        workflow_id: String,
        /// Sub-workflow nesting level (0 for top-level runs).
        depth: u32,
    },

    /// A node has started its first attempt.
    NodeStarted {
        execution_id: String,
        node_id: String,
        node_name: String,
        node_type: String,
    },

    /// A node completed successfully.
    NodeCompleted {
        execution_id: String,
        node_id: String,
        duration_ms: u64,
        retry_count: u32,
    },

    /// A node attempt failed.
    NodeFailed {
        execution_id: String,
        node_id: String,
        error: String,
        attempt: u32,
        will_retry: bool,
    },

    /// A node was marked SKIPPED without running.
    NodeSkipped {
        execution_id: String,
        node_id: String,
        reason: String,
    },

    /// An execution drained its frontier successfully.
    ExecutionCompleted {
        execution_id: String,
        workflow_id: String,
        duration_ms: u64,
        nodes_completed: u32,
    },

    /// An execution failed.
    ExecutionFailed {
        execution_id: String,
        workflow_id: String,
        error: String,
    },

    /// An execution was paused by the caller.
    ExecutionPaused { execution_id: String },

    /// A paused execution was resumed.
    ExecutionResumed { execution_id: String },

    /// An execution was cancelled by the caller.
    ExecutionCancelled { execution_id: String },
}

impl EngineEvent {
    /// The execution this event belongs to.
    pub fn execution_id(&self) -> &str {
        match self {
            EngineEvent::ExecutionStarted { execution_id, .. }
            | EngineEvent::NodeStarted { execution_id, .. }
            | EngineEvent::NodeCompleted { execution_id, .. }
            | EngineEvent::NodeFailed { execution_id, .. }
            | EngineEvent::NodeSkipped { execution_id, .. }
            | EngineEvent::ExecutionCompleted { execution_id, .. }
            | EngineEvent::ExecutionFailed { execution_id, .. }
            | EngineEvent::ExecutionPaused { execution_id }
            | EngineEvent::ExecutionResumed { execution_id }
            | EngineEvent::ExecutionCancelled { execution_id } => execution_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_failed_serde_roundtrip() {
        let event = EngineEvent::NodeFailed {
            execution_id: "exec-1".to_string(),
            node_id: "fetch".to_string(),
            error: "connection reset".to_string(),
            attempt: 2,
            will_retry: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"node_failed\""));
        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_execution_started_tag() {
        let event = EngineEvent::ExecutionStarted {
            execution_id: "exec-1".to_string(),
            workflow_id: "daily-report".to_string(),
            depth: 0,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"execution_started\""));
    }

    #[test]
    fn test_execution_id_accessor() {
        let event = EngineEvent::ExecutionPaused {
            execution_id: "exec-9".to_string(),
        };
        assert_eq!(event.execution_id(), "exec-9");

        let event = EngineEvent::NodeSkipped {
            execution_id: "exec-3".to_string(),
            node_id: "b".to_string(),
            reason: "condition 'check' was false".to_string(),
        };
        assert_eq!(event.execution_id(), "exec-3");
    }
}
