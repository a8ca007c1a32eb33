//! Dependency graph analysis: ordering, cycle detection, levels and the
//! critical path.
//!
//! Uses `petgraph` to model node dependencies as a directed graph with an edge
//! from each dependency to its dependent. Topological sort detects cycles;
//! depth-based grouping gives each node a level, and the longest chain through
//! those levels is the critical path.

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::Serialize;

use super::definition::WorkflowError;
use super::node::Workflow;

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Return node ids in an order where every node follows all of its
/// dependencies.
///
/// Fails with `UnknownDependency` for dangling references and with
/// `CycleDetected` (naming a node on the cycle, self-loops included) when the
/// graph is not a DAG.
pub fn topological_order(workflow: &Workflow) -> Result<Vec<String>, WorkflowError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let indices: HashMap<&str, _> = workflow
        .nodes
        .keys()
        .map(|id| (id.as_str(), graph.add_node(id.as_str())))
        .collect();

    for (id, node) in &workflow.nodes {
        let to = indices[id.as_str()];
        for dep in &node.dependencies {
            let from = indices.get(dep.as_str()).ok_or_else(|| {
                WorkflowError::UnknownDependency(format!(
                    "node '{}' depends on unknown node '{}'",
                    id, dep
                ))
            })?;
            graph.add_edge(*from, to, ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        WorkflowError::CycleDetected(format!("cycle detected involving node '{}'", node_id))
    })?;

    Ok(sorted.into_iter().map(|idx| graph[idx].to_string()).collect())
}

// ---------------------------------------------------------------------------
// Levels
// ---------------------------------------------------------------------------

/// Level of every node: roots are 0, everything else is one more than its
/// deepest dependency.
pub fn node_levels(workflow: &Workflow) -> Result<BTreeMap<String, usize>, WorkflowError> {
    let order = topological_order(workflow)?;
    let mut levels: BTreeMap<String, usize> = BTreeMap::new();

    for id in order {
        let level = workflow.nodes[&id]
            .dependencies
            .iter()
            .map(|dep| levels.get(dep).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        levels.insert(id, level);
    }

    Ok(levels)
}

/// Group node ids by level. Index 0 holds the roots. Nodes within a level have
/// no dependencies on each other and could run concurrently.
pub fn build_levels(workflow: &Workflow) -> Result<Vec<Vec<String>>, WorkflowError> {
    let levels = node_levels(workflow)?;
    let Some(max_level) = levels.values().copied().max() else {
        return Ok(vec![]);
    };

    let mut grouped: Vec<Vec<String>> = vec![vec![]; max_level + 1];
    for (id, level) in levels {
        grouped[level].push(id);
    }
    Ok(grouped)
}

// ---------------------------------------------------------------------------
// Critical path
// ---------------------------------------------------------------------------

/// Longest dependency chain through the graph, root first.
///
/// Each node's longest inbound chain is memoized in topological order, then
/// the path is walked back from the node with the global maximum. Ties go to
/// the node that sorts first.
pub fn critical_path(workflow: &Workflow) -> Result<Vec<String>, WorkflowError> {
    let order = topological_order(workflow)?;
    let mut length: HashMap<&str, usize> = HashMap::new();
    let mut previous: HashMap<&str, &str> = HashMap::new();

    for id in &order {
        let node = &workflow.nodes[id];
        let mut best: Option<(&str, usize)> = None;
        for dep in &node.dependencies {
            let dep_len = length.get(dep.as_str()).copied().unwrap_or(0);
            if best.is_none_or(|(_, len)| dep_len > len) {
                best = Some((dep.as_str(), dep_len));
            }
        }
        match best {
            Some((dep, len)) => {
                length.insert(id.as_str(), len + 1);
                previous.insert(id.as_str(), dep);
            }
            None => {
                length.insert(id.as_str(), 1);
            }
        }
    }

    let mut end: Option<(&str, usize)> = None;
    for id in workflow.nodes.keys() {
        let len = length[id.as_str()];
        if end.is_none_or(|(_, best)| len > best) {
            end = Some((id.as_str(), len));
        }
    }

    let mut path = Vec::new();
    let mut cursor = end.map(|(id, _)| id);
    while let Some(id) = cursor {
        path.push(id.to_string());
        cursor = previous.get(id).copied();
    }
    path.reverse();
    Ok(path)
}

// ---------------------------------------------------------------------------
// Transitive closures
// ---------------------------------------------------------------------------

/// All nodes `node_id` depends on, directly or transitively.
///
/// Returns an empty vec for an unknown node. Order is unspecified.
pub fn get_node_dependencies<'a>(node_id: &str, workflow: &'a Workflow) -> Vec<&'a str> {
    let mut visited = HashSet::new();
    let mut stack: Vec<&str> = workflow
        .nodes
        .get(node_id)
        .map(|n| n.dependencies.iter().map(String::as_str).collect())
        .unwrap_or_default();

    while let Some(current) = stack.pop() {
        let Some((key, node)) = workflow.nodes.get_key_value(current) else {
            continue;
        };
        if visited.insert(key.as_str()) {
            stack.extend(node.dependencies.iter().map(String::as_str));
        }
    }

    visited.into_iter().collect()
}

/// All nodes that depend on `node_id`, directly or transitively.
pub fn get_node_dependents<'a>(node_id: &str, workflow: &'a Workflow) -> Vec<&'a str> {
    let mut dependents: HashMap<&str, Vec<&'a str>> = HashMap::new();
    for (id, node) in &workflow.nodes {
        for dep in &node.dependencies {
            dependents.entry(dep.as_str()).or_default().push(id.as_str());
        }
    }

    let mut visited = HashSet::new();
    let mut stack: Vec<&'a str> = dependents.get(node_id).cloned().unwrap_or_default();
    while let Some(current) = stack.pop() {
        if visited.insert(current) {
            if let Some(next) = dependents.get(current) {
                stack.extend(next.iter().copied());
            }
        }
    }

    visited.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Combined analysis
// ---------------------------------------------------------------------------

/// Ordering, levels and critical path of a workflow in one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphAnalysis {
    pub order: Vec<String>,
    pub levels: Vec<Vec<String>>,
    pub critical_path: Vec<String>,
}

pub fn analyze(workflow: &Workflow) -> Result<GraphAnalysis, WorkflowError> {
    Ok(GraphAnalysis {
        order: topological_order(workflow)?,
        levels: build_levels(workflow)?,
        critical_path: critical_path(workflow)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::node::{WorkflowNode, task_handler};
    use serde_json::Value;

    fn node(id: &str, deps: &[&str]) -> WorkflowNode {
        WorkflowNode::task(id, id, task_handler(|_ctx| async { Ok(Value::Null) }))
            .depends_on(deps.iter().copied())
    }

    fn workflow(nodes: Vec<WorkflowNode>) -> Workflow {
        let start = nodes.first().map(|n| n.id.clone()).unwrap_or_default();
        nodes
            .into_iter()
            .fold(Workflow::new("wf", "Workflow", start), Workflow::with_node)
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|n| n == id).unwrap()
    }

    // -----------------------------------------------------------------------
    // Ordering and cycles
    // -----------------------------------------------------------------------

    #[test]
    fn test_order_respects_dependencies() {
        let wf = workflow(vec![
            node("start", &[]),
            node("left", &["start"]),
            node("right", &["start"]),
            node("end", &["left", "right"]),
        ]);
        let order = topological_order(&wf).unwrap();
        assert_eq!(order.len(), 4);
        assert!(position(&order, "start") < position(&order, "left"));
        assert!(position(&order, "start") < position(&order, "right"));
        assert!(position(&order, "left") < position(&order, "end"));
        assert!(position(&order, "right") < position(&order, "end"));
    }

    #[test]
    fn test_cycle_detected() {
        let wf = workflow(vec![
            node("a", &["c"]),
            node("b", &["a"]),
            node("c", &["b"]),
        ]);
        let err = topological_order(&wf).unwrap_err();
        match err {
            WorkflowError::CycleDetected(msg) => assert!(msg.contains("involving node")),
            other => panic!("expected CycleDetected, got: {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let wf = workflow(vec![node("a", &["a"])]);
        assert!(matches!(
            topological_order(&wf),
            Err(WorkflowError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_unknown_dependency() {
        let wf = workflow(vec![node("a", &["ghost"])]);
        let err = topological_order(&wf).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    // -----------------------------------------------------------------------
    // Levels
    // -----------------------------------------------------------------------

    #[test]
    fn test_levels_diamond() {
        let wf = workflow(vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["a"]),
            node("d", &["b", "c"]),
        ]);
        let levels = node_levels(&wf).unwrap();
        assert_eq!(levels["a"], 0);
        assert_eq!(levels["b"], 1);
        assert_eq!(levels["c"], 1);
        assert_eq!(levels["d"], 2);

        let grouped = build_levels(&wf).unwrap();
        assert_eq!(grouped, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn test_level_uses_deepest_dependency() {
        let wf = workflow(vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["b"]),
            node("d", &["a", "c"]),
        ]);
        assert_eq!(node_levels(&wf).unwrap()["d"], 3);
    }

    #[test]
    fn test_empty_workflow_has_no_levels() {
        let wf = Workflow::new("empty", "Empty", "none");
        assert!(build_levels(&wf).unwrap().is_empty());
        assert!(critical_path(&wf).unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Critical path
    // -----------------------------------------------------------------------

    #[test]
    fn test_critical_path_follows_longest_chain() {
        let wf = workflow(vec![
            node("start", &[]),
            node("short", &["start"]),
            node("long1", &["start"]),
            node("long2", &["long1"]),
            node("end", &["short", "long2"]),
        ]);
        assert_eq!(
            critical_path(&wf).unwrap(),
            vec!["start", "long1", "long2", "end"]
        );
    }

    #[test]
    fn test_critical_path_single_node() {
        let wf = workflow(vec![node("only", &[])]);
        assert_eq!(critical_path(&wf).unwrap(), vec!["only"]);
    }

    // -----------------------------------------------------------------------
    // Transitive closures
    // -----------------------------------------------------------------------

    #[test]
    fn test_transitive_dependencies() {
        let wf = workflow(vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["b"]),
            node("x", &[]),
        ]);
        let mut deps = get_node_dependencies("c", &wf);
        deps.sort();
        assert_eq!(deps, vec!["a", "b"]);
        assert!(get_node_dependencies("a", &wf).is_empty());
        assert!(get_node_dependencies("ghost", &wf).is_empty());
    }

    #[test]
    fn test_transitive_dependents() {
        let wf = workflow(vec![
            node("check", &[]),
            node("yes", &["check"]),
            node("after_yes", &["yes"]),
            node("other", &[]),
            node("join", &["after_yes", "other"]),
        ]);
        let mut dependents = get_node_dependents("check", &wf);
        dependents.sort();
        assert_eq!(dependents, vec!["after_yes", "join", "yes"]);
        assert!(get_node_dependents("join", &wf).is_empty());
    }

    #[test]
    fn test_analyze_combines_results() {
        let wf = workflow(vec![node("a", &[]), node("b", &["a"])]);
        let analysis = analyze(&wf).unwrap();
        assert_eq!(analysis.order, vec!["a", "b"]);
        assert_eq!(analysis.levels, vec![vec!["a"], vec!["b"]]);
        assert_eq!(analysis.critical_path, vec!["a", "b"]);
    }
}
