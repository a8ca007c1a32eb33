//! Workflow validation and JSON export/import.
//!
//! Converts between the in-memory `Workflow` and the serializable
//! `WorkflowDefinition` IR, and checks the structural constraints a graph
//! must satisfy before the scheduler will run it.

use stepweave_types::workflow::{NodeType, ValidationReport, WorkflowDefinition};
use thiserror::Error;

use super::dag;
use super::node::{NodeKind, Workflow};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while building, validating or (de)serializing a workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// JSON parse or serialization failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A node references an unknown dependency.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// No node with this id exists in the workflow.
    #[error("unknown node '{0}'")]
    UnknownNode(String),

    /// A handler was attached to a node of the wrong kind.
    #[error("node '{node_id}' is a {actual} node, expected {expected}")]
    KindMismatch {
        node_id: String,
        expected: &'static str,
        actual: NodeType,
    },
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// Serialize a workflow to pretty JSON. Closures are not part of the output.
pub fn serialize_workflow_json(workflow: &Workflow) -> Result<String, WorkflowError> {
    serde_json::to_string_pretty(&workflow.to_definition())
        .map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Parse JSON produced by [`serialize_workflow_json`].
///
/// Only the shape is checked here. Handlers still need re-attaching, so the
/// validator is not run.
pub fn parse_workflow_json(json: &str) -> Result<Workflow, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    Workflow::from_definition(def)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check a workflow's static structure, collecting every violation.
///
/// Cycles are not reported here; [`ensure_executable`] adds that check.
pub fn validate_workflow(workflow: &Workflow) -> ValidationReport {
    let mut errors = Vec::new();

    if workflow.id.trim().is_empty() {
        errors.push("workflow id must not be empty".to_string());
    }

    if !workflow.nodes.contains_key(&workflow.start_node_id) {
        errors.push(format!(
            "start node '{}' not found",
            workflow.start_node_id
        ));
    }

    for (id, node) in &workflow.nodes {
        for dep in &node.dependencies {
            if !workflow.nodes.contains_key(dep) {
                errors.push(format!("node '{}' depends on unknown node '{}'", id, dep));
            }
        }

        match &node.kind {
            NodeKind::Task { handler: None } => {
                errors.push(format!("task node '{}' has no handler", id));
            }
            NodeKind::Condition { predicate: None } => {
                errors.push(format!("condition node '{}' has no predicate", id));
            }
            NodeKind::SubWorkflow { workflow_id } => {
                if workflow_id.as_deref().is_none_or(|w| w.trim().is_empty()) {
                    errors.push(format!("sub-workflow node '{}' has no target workflow", id));
                }
            }
            NodeKind::Parallel { tasks, task_count } if tasks.len() != *task_count => {
                errors.push(format!(
                    "parallel node '{}' declares {} tasks but has {} attached",
                    id,
                    task_count,
                    tasks.len()
                ));
            }
            NodeKind::Loop { variable, .. } if variable.trim().is_empty() => {
                errors.push(format!("loop node '{}' has an empty loop variable", id));
            }
            _ => {}
        }
    }

    ValidationReport::from_errors(errors)
}

/// Everything the scheduler requires before it starts: a clean validation
/// report and an acyclic dependency graph.
pub fn ensure_executable(workflow: &Workflow) -> Result<(), WorkflowError> {
    let report = validate_workflow(workflow);
    if !report.valid {
        return Err(WorkflowError::ValidationError(report.errors.join("; ")));
    }
    dag::topological_order(workflow)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::node::{WorkflowNode, condition_fn, parallel_task, task_handler};
    use serde_json::{Value, json};

    fn ok_task(id: &str) -> WorkflowNode {
        WorkflowNode::task(id, id, task_handler(|_ctx| async { Ok(Value::Null) }))
    }

    fn valid_workflow() -> Workflow {
        Workflow::new("pipeline", "Pipeline", "fetch")
            .with_node(ok_task("fetch"))
            .with_node(ok_task("transform").depends_on(["fetch"]))
            .with_node(
                WorkflowNode::condition("check", "Check", condition_fn(|_| true))
                    .depends_on(["transform"]),
            )
            .with_variable("limit", json!(5))
    }

    #[test]
    fn test_valid_workflow_passes() {
        let report = validate_workflow(&valid_workflow());
        assert!(report.valid, "errors: {:?}", report.errors);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_validator_accumulates_errors() {
        let wf = Workflow::new("broken", "Broken", "missing")
            .with_node(ok_task("a").depends_on(["ghost"]))
            .with_node(WorkflowNode::from_definition(
                &WorkflowNode::condition("c", "C", condition_fn(|_| true)).to_definition(),
            ))
            .with_node(WorkflowNode::repeat("l", "Loop", 2, ""));

        let report = validate_workflow(&wf);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 4, "errors: {:?}", report.errors);
        assert!(report.errors.iter().any(|e| e.contains("start node 'missing'")));
        assert!(report.errors.iter().any(|e| e.contains("unknown node 'ghost'")));
        assert!(report.errors.iter().any(|e| e.contains("no predicate")));
        assert!(report.errors.iter().any(|e| e.contains("empty loop variable")));
    }

    #[test]
    fn test_repeated_dependency_is_allowed() {
        let wf = Workflow::new("wf", "Workflow", "a")
            .with_node(ok_task("a"))
            .with_node(ok_task("b").depends_on(["a", "a"]));

        assert!(validate_workflow(&wf).valid);
        assert!(ensure_executable(&wf).is_ok());
    }

    #[test]
    fn test_parallel_task_count_must_match_declaration() {
        let declared = WorkflowNode::parallel(
            "p",
            "Parallel",
            vec![
                parallel_task(|| async { Ok(json!(1)) }),
                parallel_task(|| async { Ok(json!(2)) }),
            ],
        );
        let imported = WorkflowNode::from_definition(&declared.to_definition());
        let mut wf = Workflow::new("wf", "Workflow", "p").with_node(imported);

        let report = validate_workflow(&wf);
        assert_eq!(
            report.errors,
            vec!["parallel node 'p' declares 2 tasks but has 0 attached"]
        );

        wf.attach_parallel_tasks("p", vec![parallel_task(|| async { Ok(json!(1)) })])
            .unwrap();
        assert!(!validate_workflow(&wf).valid);

        wf.attach_parallel_tasks(
            "p",
            vec![
                parallel_task(|| async { Ok(json!(1)) }),
                parallel_task(|| async { Ok(json!(2)) }),
            ],
        )
        .unwrap();
        assert!(validate_workflow(&wf).valid);
    }

    #[test]
    fn test_sub_workflow_without_target_rejected() {
        let mut node = WorkflowNode::sub_workflow("s", "Sub", "child");
        node.kind = NodeKind::SubWorkflow { workflow_id: None };
        let wf = Workflow::new("wf", "Workflow", "s").with_node(node);

        let report = validate_workflow(&wf);
        assert_eq!(report.errors, vec!["sub-workflow node 's' has no target workflow"]);
    }

    #[test]
    fn test_validator_ignores_cycles() {
        let wf = Workflow::new("cyclic", "Cyclic", "a")
            .with_node(ok_task("a").depends_on(["b"]))
            .with_node(ok_task("b").depends_on(["a"]));

        assert!(validate_workflow(&wf).valid);
        let err = ensure_executable(&wf).unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected(_)));
    }

    #[test]
    fn test_ensure_executable_joins_errors() {
        let wf = Workflow::new("wf", "Workflow", "nope").with_node(ok_task("a"));
        let err = ensure_executable(&wf).unwrap_err();
        assert!(err.to_string().contains("start node 'nope' not found"));
    }

    #[test]
    fn test_json_export_import_preserves_structure() {
        let wf = valid_workflow().with_description("nightly").with_version("2.1.0");
        let json = serialize_workflow_json(&wf).unwrap();

        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["start_node_id"], "fetch");
        assert_eq!(parsed["nodes"]["check"]["config"]["type"], "condition");

        let imported = parse_workflow_json(&json).unwrap();
        assert_eq!(imported.to_definition(), wf.to_definition());
        // Handlers did not survive, so the import is not yet runnable
        assert!(!validate_workflow(&imported).valid);
    }

    #[test]
    fn test_parse_invalid_json() {
        let err = parse_workflow_json("{ not json").unwrap_err();
        assert!(matches!(err, WorkflowError::ParseError(_)));
    }
}
