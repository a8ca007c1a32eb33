//! Execution context shared between the scheduler and node handlers.
//!
//! `WorkflowContext` is the working memory of one execution: input payload,
//! variables, per-node outputs and free-form metadata. The scheduler owns it
//! through a `ContextHandle`, and every handler receives a clone of that
//! handle inside its `NodeContext`. Writes are last-write-wins; the engine
//! does not isolate concurrent handlers touching the same key.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

/// Working memory of a single execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub workflow_id: String,
    pub execution_id: String,
    /// Variables seeded from the workflow definition, then written by LOOP
    /// nodes and handlers.
    pub variables: HashMap<String, Value>,
    /// Caller-supplied input payload.
    pub input: Value,
    /// Results keyed by node id, filled as nodes complete.
    pub output: HashMap<String, Value>,
    pub metadata: HashMap<String, Value>,
    /// Most recently started node (racy under concurrent batches).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl WorkflowContext {
    pub fn new(
        workflow_id: String,
        execution_id: String,
        input: Value,
        variables: HashMap<String, Value>,
    ) -> Self {
        Self {
            workflow_id,
            execution_id,
            variables,
            input,
            output: HashMap::new(),
            metadata: HashMap::new(),
            node_id: None,
        }
    }

    /// Output of a completed node.
    pub fn get_output(&self, node_id: &str) -> Option<&Value> {
        self.output.get(node_id)
    }

    /// All node outputs as a single JSON object. This is what a
    /// SUB_WORKFLOW node returns to its parent.
    pub fn output_value(&self) -> Value {
        let map: Map<String, Value> = self
            .output
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(map)
    }
}

// ---------------------------------------------------------------------------
// ContextHandle
// ---------------------------------------------------------------------------

/// Shared, interior-mutable reference to an execution's context.
///
/// Cloning is cheap and every clone observes the same context. Locks are only
/// held for the duration of a single accessor call, never across an await.
#[derive(Debug, Clone)]
pub struct ContextHandle {
    inner: Arc<RwLock<WorkflowContext>>,
}

impl ContextHandle {
    pub fn new(ctx: WorkflowContext) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ctx)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, WorkflowContext> {
        self.inner.read().expect("workflow context lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, WorkflowContext> {
        self.inner.write().expect("workflow context lock poisoned")
    }

    /// Clone of the current context.
    pub fn snapshot(&self) -> WorkflowContext {
        self.read().clone()
    }

    pub fn execution_id(&self) -> String {
        self.read().execution_id.clone()
    }

    pub fn input(&self) -> Value {
        self.read().input.clone()
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.read().variables.get(name).cloned()
    }

    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.write().variables.insert(name.into(), value);
    }

    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.read().metadata.get(key).cloned()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.write().metadata.insert(key.into(), value);
    }

    /// Output of a completed node.
    pub fn output(&self, node_id: &str) -> Option<Value> {
        self.read().output.get(node_id).cloned()
    }

    /// All node outputs as a JSON object.
    pub fn output_value(&self) -> Value {
        self.read().output_value()
    }

    pub fn current_node(&self) -> Option<String> {
        self.read().node_id.clone()
    }

    pub(crate) fn set_output(&self, node_id: &str, value: Value) {
        self.write().output.insert(node_id.to_string(), value);
    }

    pub(crate) fn set_current_node(&self, node_id: &str) {
        self.write().node_id = Some(node_id.to_string());
    }
}

// ---------------------------------------------------------------------------
// NodeContext
// ---------------------------------------------------------------------------

/// What a handler sees when it is invoked.
#[derive(Debug, Clone)]
pub struct NodeContext {
    /// Id of the node being executed.
    pub node_id: String,
    /// Zero-based iteration index when invoked by a LOOP node.
    pub iteration: Option<u32>,
    /// The execution's shared context.
    pub context: ContextHandle,
    /// Cancelled when the execution is cancelled. Handlers that want to stop
    /// early watch this; the engine never aborts them.
    pub cancellation: CancellationToken,
}

impl NodeContext {
    pub fn new(
        node_id: impl Into<String>,
        context: ContextHandle,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            iteration: None,
            context,
            cancellation,
        }
    }

    pub(crate) fn for_iteration(&self, iteration: u32) -> Self {
        Self {
            iteration: Some(iteration),
            ..self.clone()
        }
    }

    pub fn input(&self) -> Value {
        self.context.input()
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.context.variable(name)
    }

    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.context.set_variable(name, value);
    }

    pub fn output_of(&self, node_id: &str) -> Option<Value> {
        self.context.output(node_id)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_context() -> WorkflowContext {
        let mut variables = HashMap::new();
        variables.insert("region".to_string(), json!("eu"));
        WorkflowContext::new(
            "test-workflow".to_string(),
            "exec-1".to_string(),
            json!({ "source": "test" }),
            variables,
        )
    }

    #[test]
    fn test_new_context_seeds_variables() {
        let ctx = test_context();
        assert_eq!(ctx.workflow_id, "test-workflow");
        assert_eq!(ctx.variables.get("region"), Some(&json!("eu")));
        assert!(ctx.output.is_empty());
        assert!(ctx.node_id.is_none());
    }

    #[test]
    fn test_output_value_is_object() {
        let mut ctx = test_context();
        ctx.output.insert("a".to_string(), json!(1));
        ctx.output.insert("b".to_string(), json!("two"));
        let value = ctx.output_value();
        assert_eq!(value["a"], json!(1));
        assert_eq!(value["b"], json!("two"));
        assert_eq!(ctx.get_output("a"), Some(&json!(1)));
    }

    #[test]
    fn test_handle_clones_share_state() {
        let handle = ContextHandle::new(test_context());
        let other = handle.clone();

        other.set_variable("count", json!(3));
        other.set_metadata("owner", json!("ops"));
        handle.set_output("fetch", json!({ "rows": 10 }));

        assert_eq!(handle.variable("count"), Some(json!(3)));
        assert_eq!(handle.metadata("owner"), Some(json!("ops")));
        assert_eq!(other.output("fetch"), Some(json!({ "rows": 10 })));
    }

    #[test]
    fn test_snapshot_is_detached() {
        let handle = ContextHandle::new(test_context());
        let snap = handle.snapshot();
        handle.set_variable("later", json!(true));
        assert!(!snap.variables.contains_key("later"));
    }

    #[test]
    fn test_node_context_iteration() {
        let handle = ContextHandle::new(test_context());
        let node_ctx = NodeContext::new("loop", handle, CancellationToken::new());
        assert!(node_ctx.iteration.is_none());
        let iter_ctx = node_ctx.for_iteration(2);
        assert_eq!(iter_ctx.iteration, Some(2));
        assert_eq!(iter_ctx.input()["source"], json!("test"));
        assert!(!iter_ctx.is_cancelled());
    }

    #[test]
    fn test_context_serde_roundtrip() {
        let mut ctx = test_context();
        ctx.output.insert("a".to_string(), json!([1, 2]));
        let json = serde_json::to_value(&ctx).unwrap();
        let restored: WorkflowContext = serde_json::from_value(json).unwrap();
        assert_eq!(restored, ctx);
    }
}
