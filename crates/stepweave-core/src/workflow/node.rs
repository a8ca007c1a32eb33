//! In-memory workflow graph: nodes, handler seams, and the `Workflow` builder.
//!
//! A `Workflow` is built programmatically, registered with the engine, and
//! never mutated afterwards. Each `WorkflowNode` carries a `NodeKind` whose
//! variants hold exactly the parameters that kind needs, including the
//! caller-supplied closures (task handlers, condition predicates, parallel
//! tasks) that the serializable `NodeDefinition` cannot represent.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use stepweave_types::workflow::{NodeConfig, NodeDefinition, NodeType, WorkflowDefinition};

use super::context::NodeContext;
use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// Handler seams
// ---------------------------------------------------------------------------

/// Future returned by task handlers and parallel tasks.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Async work for TASK and LOOP nodes.
pub type TaskHandler = Arc<dyn Fn(NodeContext) -> HandlerFuture + Send + Sync>;

/// Boolean predicate for CONDITION nodes.
pub type ConditionFn = Arc<dyn Fn(&NodeContext) -> bool + Send + Sync>;

/// One zero-argument entry of a PARALLEL node.
pub type ParallelTask = Arc<dyn Fn() -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`TaskHandler`].
pub fn task_handler<F, Fut>(f: F) -> TaskHandler
where
    F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |ctx: NodeContext| -> HandlerFuture { Box::pin(f(ctx)) })
}

/// Wrap a closure as a [`ConditionFn`].
pub fn condition_fn<F>(f: F) -> ConditionFn
where
    F: Fn(&NodeContext) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap an async closure as a [`ParallelTask`].
pub fn parallel_task<F, Fut>(f: F) -> ParallelTask
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move || -> HandlerFuture { Box::pin(f()) })
}

// ---------------------------------------------------------------------------
// NodeKind
// ---------------------------------------------------------------------------

/// Kind-specific parameters of a node.
///
/// Handler-bearing fields are `Option` so that an imported workflow (whose
/// closures were dropped on export) can exist until handlers are re-attached.
/// The validator reports any that are still missing.
#[derive(Clone)]
pub enum NodeKind {
    Task {
        handler: Option<TaskHandler>,
    },
    Condition {
        predicate: Option<ConditionFn>,
    },
    Loop {
        count: u32,
        variable: String,
        handler: Option<TaskHandler>,
    },
    Parallel {
        tasks: Vec<ParallelTask>,
        /// Number of tasks the node was declared with. Survives export, so an
        /// imported node stays invalid until the same number is re-attached.
        task_count: usize,
    },
    Delay {
        delay_ms: Option<u64>,
    },
    SubWorkflow {
        workflow_id: Option<String>,
    },
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Task { .. } => NodeType::Task,
            NodeKind::Condition { .. } => NodeType::Condition,
            NodeKind::Loop { .. } => NodeType::Loop,
            NodeKind::Parallel { .. } => NodeType::Parallel,
            NodeKind::Delay { .. } => NodeType::Delay,
            NodeKind::SubWorkflow { .. } => NodeType::SubWorkflow,
        }
    }

    fn to_config(&self) -> NodeConfig {
        match self {
            NodeKind::Task { .. } => NodeConfig::Task,
            NodeKind::Condition { .. } => NodeConfig::Condition,
            NodeKind::Loop {
                count, variable, ..
            } => NodeConfig::Loop {
                loop_count: *count,
                loop_variable: variable.clone(),
            },
            NodeKind::Parallel { task_count, .. } => NodeConfig::Parallel {
                task_count: *task_count,
            },
            NodeKind::Delay { delay_ms } => NodeConfig::Delay {
                delay_ms: *delay_ms,
            },
            NodeKind::SubWorkflow { workflow_id } => NodeConfig::SubWorkflow {
                sub_workflow_id: workflow_id.clone(),
            },
        }
    }

    fn from_config(config: &NodeConfig) -> Self {
        match config {
            NodeConfig::Task => NodeKind::Task { handler: None },
            NodeConfig::Condition => NodeKind::Condition { predicate: None },
            NodeConfig::Loop {
                loop_count,
                loop_variable,
            } => NodeKind::Loop {
                count: *loop_count,
                variable: loop_variable.clone(),
                handler: None,
            },
            NodeConfig::Parallel { task_count } => NodeKind::Parallel {
                tasks: Vec::new(),
                task_count: *task_count,
            },
            NodeConfig::Delay { delay_ms } => NodeKind::Delay {
                delay_ms: *delay_ms,
            },
            NodeConfig::SubWorkflow { sub_workflow_id } => NodeKind::SubWorkflow {
                workflow_id: sub_workflow_id.clone(),
            },
        }
    }
}

impl std::fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Task { handler } => f
                .debug_struct("Task")
                .field("handler", &handler.is_some())
                .finish(),
            NodeKind::Condition { predicate } => f
                .debug_struct("Condition")
                .field("predicate", &predicate.is_some())
                .finish(),
            NodeKind::Loop {
                count,
                variable,
                handler,
            } => f
                .debug_struct("Loop")
                .field("count", count)
                .field("variable", variable)
                .field("handler", &handler.is_some())
                .finish(),
            NodeKind::Parallel { tasks, task_count } => f
                .debug_struct("Parallel")
                .field("tasks", &tasks.len())
                .field("task_count", task_count)
                .finish(),
            NodeKind::Delay { delay_ms } => {
                f.debug_struct("Delay").field("delay_ms", delay_ms).finish()
            }
            NodeKind::SubWorkflow { workflow_id } => f
                .debug_struct("SubWorkflow")
                .field("workflow_id", workflow_id)
                .finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowNode
// ---------------------------------------------------------------------------

/// One unit of work or control construct in a workflow graph.
#[derive(Debug, Clone)]
pub struct WorkflowNode {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Nodes that must reach COMPLETED before this one may start.
    pub dependencies: Vec<String>,
    /// Overrides the engine's default retry budget.
    pub max_retries: Option<u32>,
    /// Per-attempt timeout. None means the attempt may run indefinitely.
    pub timeout_ms: Option<u64>,
    pub kind: NodeKind,
}

impl WorkflowNode {
    fn with_kind(id: impl Into<String>, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            dependencies: Vec::new(),
            max_retries: None,
            timeout_ms: None,
            kind,
        }
    }

    pub fn task(id: impl Into<String>, name: impl Into<String>, handler: TaskHandler) -> Self {
        Self::with_kind(id, name, NodeKind::Task {
            handler: Some(handler),
        })
    }

    pub fn condition(
        id: impl Into<String>,
        name: impl Into<String>,
        predicate: ConditionFn,
    ) -> Self {
        Self::with_kind(id, name, NodeKind::Condition {
            predicate: Some(predicate),
        })
    }

    /// A LOOP node without a body; attach one with [`WorkflowNode::with_handler`].
    pub fn repeat(
        id: impl Into<String>,
        name: impl Into<String>,
        count: u32,
        variable: impl Into<String>,
    ) -> Self {
        Self::with_kind(id, name, NodeKind::Loop {
            count,
            variable: variable.into(),
            handler: None,
        })
    }

    pub fn parallel(
        id: impl Into<String>,
        name: impl Into<String>,
        tasks: Vec<ParallelTask>,
    ) -> Self {
        let task_count = tasks.len();
        Self::with_kind(id, name, NodeKind::Parallel { tasks, task_count })
    }

    pub fn delay(id: impl Into<String>, name: impl Into<String>, delay_ms: u64) -> Self {
        Self::with_kind(id, name, NodeKind::Delay {
            delay_ms: Some(delay_ms),
        })
    }

    pub fn sub_workflow(
        id: impl Into<String>,
        name: impl Into<String>,
        workflow_id: impl Into<String>,
    ) -> Self {
        Self::with_kind(id, name, NodeKind::SubWorkflow {
            workflow_id: Some(workflow_id.into()),
        })
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Set the handler of a TASK or LOOP node. Ignored for other kinds.
    pub fn with_handler(mut self, handler: TaskHandler) -> Self {
        match &mut self.kind {
            NodeKind::Task { handler: slot } | NodeKind::Loop { handler: slot, .. } => {
                *slot = Some(handler);
            }
            _ => {}
        }
        self
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn to_definition(&self) -> NodeDefinition {
        NodeDefinition {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            dependencies: self.dependencies.clone(),
            max_retries: self.max_retries,
            timeout_ms: self.timeout_ms,
            config: self.kind.to_config(),
        }
    }

    /// Rebuild a node from its definition. Closures are left empty.
    pub fn from_definition(def: &NodeDefinition) -> Self {
        Self {
            id: def.id.clone(),
            name: def.name.clone(),
            description: def.description.clone(),
            dependencies: def.dependencies.clone(),
            max_retries: def.max_retries,
            timeout_ms: def.timeout_ms,
            kind: NodeKind::from_config(&def.config),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A workflow graph ready to be registered with the engine.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub version: String,
    pub start_node_id: String,
    pub nodes: BTreeMap<String, WorkflowNode>,
    pub variables: BTreeMap<String, Value>,
    pub metadata: BTreeMap<String, Value>,
}

impl Workflow {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        start_node_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            version: "1.0.0".to_string(),
            start_node_id: start_node_id.into(),
            nodes: BTreeMap::new(),
            variables: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Add a node, replacing any node with the same id.
    pub fn with_node(mut self, node: WorkflowNode) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn node(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(node_id)
    }

    fn node_mut(&mut self, node_id: &str) -> Result<&mut WorkflowNode, WorkflowError> {
        self.nodes
            .get_mut(node_id)
            .ok_or_else(|| WorkflowError::UnknownNode(node_id.to_string()))
    }

    /// Re-attach the handler of a TASK or LOOP node (e.g. after import).
    pub fn attach_task_handler(
        &mut self,
        node_id: &str,
        handler: TaskHandler,
    ) -> Result<(), WorkflowError> {
        let node = self.node_mut(node_id)?;
        match &mut node.kind {
            NodeKind::Task { handler: slot } | NodeKind::Loop { handler: slot, .. } => {
                *slot = Some(handler);
                Ok(())
            }
            other => Err(WorkflowError::KindMismatch {
                node_id: node_id.to_string(),
                expected: "task or loop",
                actual: other.node_type(),
            }),
        }
    }

    /// Re-attach the predicate of a CONDITION node.
    pub fn attach_condition(
        &mut self,
        node_id: &str,
        predicate: ConditionFn,
    ) -> Result<(), WorkflowError> {
        let node = self.node_mut(node_id)?;
        match &mut node.kind {
            NodeKind::Condition { predicate: slot } => {
                *slot = Some(predicate);
                Ok(())
            }
            other => Err(WorkflowError::KindMismatch {
                node_id: node_id.to_string(),
                expected: "condition",
                actual: other.node_type(),
            }),
        }
    }

    /// Replace the task list of a PARALLEL node. The declared task count is
    /// kept; validation rejects a list of a different length.
    pub fn attach_parallel_tasks(
        &mut self,
        node_id: &str,
        tasks: Vec<ParallelTask>,
    ) -> Result<(), WorkflowError> {
        let node = self.node_mut(node_id)?;
        match &mut node.kind {
            NodeKind::Parallel { tasks: slot, .. } => {
                *slot = tasks;
                Ok(())
            }
            other => Err(WorkflowError::KindMismatch {
                node_id: node_id.to_string(),
                expected: "parallel",
                actual: other.node_type(),
            }),
        }
    }

    pub fn to_definition(&self) -> WorkflowDefinition {
        WorkflowDefinition {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            version: self.version.clone(),
            start_node_id: self.start_node_id.clone(),
            nodes: self
                .nodes
                .iter()
                .map(|(id, node)| (id.clone(), node.to_definition()))
                .collect(),
            variables: self.variables.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Rebuild a workflow from its definition. Every map key must match the
    /// id of the node stored under it.
    pub fn from_definition(def: WorkflowDefinition) -> Result<Self, WorkflowError> {
        let mut nodes = BTreeMap::new();
        for (key, node_def) in &def.nodes {
            if key != &node_def.id {
                return Err(WorkflowError::ValidationError(format!(
                    "node stored under key '{}' has id '{}'",
                    key, node_def.id
                )));
            }
            nodes.insert(key.clone(), WorkflowNode::from_definition(node_def));
        }

        Ok(Self {
            id: def.id,
            name: def.name,
            description: def.description,
            version: def.version,
            start_node_id: def.start_node_id,
            nodes,
            variables: def.variables,
            metadata: def.metadata,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
