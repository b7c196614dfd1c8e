use super::{RunId, RunNodeId, WorkflowId, WorkflowVersionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Function,
    SubWorkflow,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_ms: 100,
            max_backoff_ms: 1_000,
        }
    }
}

/// One node of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub node_key: String,
    pub node_type: NodeType,
    pub target_name: String,
    pub retry_policy: RetryPolicy,
    pub timeout_s: u32,
    pub input_mapping: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub from: String,
    pub to: String,
}

/// `{nodes, edges}` — must form a finite DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DagError {
    #[error("workflow definition has no nodes")]
    Empty,
    #[error("duplicate node key: {0}")]
    DuplicateNodeKey(String),
    #[error("edge references unknown node: {0}")]
    UnknownEdgeEndpoint(String),
    #[error("self-loop on node: {0}")]
    SelfLoop(String),
    #[error("cycle detected, involving at least node: {0}")]
    Cycle(String),
}

impl WorkflowDefinition {
    /// DAG validity per Glossary: nonempty node set; unique non-empty
    /// node_keys; every edge endpoint present; no self-loops; Kahn's
    /// topological sort consumes all nodes.
    pub fn validate(&self) -> Result<(), DagError> {
        if self.nodes.is_empty() {
            return Err(DagError::Empty);
        }

        let mut seen = HashSet::new();
        for n in &self.nodes {
            if n.node_key.is_empty() || !seen.insert(n.node_key.clone()) {
                return Err(DagError::DuplicateNodeKey(n.node_key.clone()));
            }
        }

        for e in &self.edges {
            if e.from == e.to {
                return Err(DagError::SelfLoop(e.from.clone()));
            }
            if !seen.contains(&e.from) {
                return Err(DagError::UnknownEdgeEndpoint(e.from.clone()));
            }
            if !seen.contains(&e.to) {
                return Err(DagError::UnknownEdgeEndpoint(e.to.clone()));
            }
        }

        let mut indeg: HashMap<&str, u32> = self.nodes.iter().map(|n| (n.node_key.as_str(), 0)).collect();
        let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
        for e in &self.edges {
            *indeg.get_mut(e.to.as_str()).unwrap() += 1;
            adj.entry(e.from.as_str()).or_default().push(e.to.as_str());
        }

        let mut queue: Vec<&str> = indeg
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        queue.sort_unstable();
        let mut visited = 0usize;
        let mut cursor = 0usize;
        while cursor < queue.len() {
            let node = queue[cursor];
            cursor += 1;
            visited += 1;
            if let Some(succs) = adj.get(node) {
                for s in succs {
                    let d = indeg.get_mut(s).unwrap();
                    *d -= 1;
                    if *d == 0 {
                        queue.push(s);
                    }
                }
            }
        }

        if visited != self.nodes.len() {
            let stuck = indeg
                .into_iter()
                .find(|(_, d)| *d > 0)
                .map(|(k, _)| k.to_string())
                .unwrap_or_default();
            return Err(DagError::Cycle(stuck));
        }

        Ok(())
    }

    pub fn node(&self, key: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.node_key == key)
    }

    pub fn predecessors(&self, key: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == key)
            .map(|e| e.from.as_str())
            .collect()
    }

    pub fn successors(&self, key: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == key)
            .map(|e| e.to.as_str())
            .collect()
    }
}

/// Immutable snapshot of a definition with a monotonically increasing
/// version per workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub id: WorkflowVersionId,
    pub workflow_id: WorkflowId,
    pub version: u32,
    pub definition: WorkflowDefinition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// How a run's final `output` is chosen when the DAG has multiple leaves:
/// either a single designated terminal node, or a map of every leaf's
/// output, set at trigger time so it never depends on how many leaves
/// happen to exist when the run finalizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TerminalOutputPolicy {
    /// A single node_key designated as the run's terminal output.
    DesignatedNode(String),
    /// A map of every leaf node_key to its output.
    LeafMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub version_id: WorkflowVersionId,
    pub status: RunStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub output_policy: TerminalOutputPolicy,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunNodeStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl RunNodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunNodeStatus::Succeeded | RunNodeStatus::Failed | RunNodeStatus::Skipped
        )
    }
}

/// One materialized node within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunNode {
    pub id: RunNodeId,
    pub run_id: RunId,
    pub node_key: String,
    pub status: RunNodeStatus,
    pub unresolved_deps: u32,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub attempt: u32,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl RunNode {
    /// Invariant: a node transitioning to `ready` must have
    /// `unresolved_deps == 0` at that instant.
    pub fn mark_ready(&mut self) {
        debug_assert_eq!(self.unresolved_deps, 0);
        self.status = RunNodeStatus::Ready;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    fn node(key: &str) -> WorkflowNode {
        WorkflowNode {
            node_key: key.to_string(),
            node_type: NodeType::Function,
            target_name: key.to_string(),
            retry_policy: RetryPolicy::default(),
            timeout_s: 30,
            input_mapping: None,
        }
    }

    fn edge(from: &str, to: &str) -> WorkflowEdge {
        WorkflowEdge {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    #[test]
    fn accepts_valid_fan_in_dag() {
        let def = WorkflowDefinition {
            nodes: vec![node("a"), node("b"), node("c")],
            edges: vec![edge("a", "c"), edge("b", "c")],
        };
        assert!(def.validate().is_ok());
    }

    #[test]
    fn rejects_self_loop() {
        let def = WorkflowDefinition {
            nodes: vec![node("a")],
            edges: vec![edge("a", "a")],
        };
        assert_eq!(def.validate(), Err(DagError::SelfLoop("a".to_string())));
    }

    #[test]
    fn rejects_cycle() {
        let def = WorkflowDefinition {
            nodes: vec![node("a"), node("b")],
            edges: vec![edge("a", "b"), edge("b", "a")],
        };
        assert!(matches!(def.validate(), Err(DagError::Cycle(_))));
    }

    #[test]
    fn rejects_duplicate_keys() {
        let def = WorkflowDefinition {
            nodes: vec![node("a"), node("a")],
            edges: vec![],
        };
        assert_eq!(
            def.validate(),
            Err(DagError::DuplicateNodeKey("a".to_string()))
        );
    }

    #[test]
    fn rejects_unknown_edge_endpoint() {
        let def = WorkflowDefinition {
            nodes: vec![node("a")],
            edges: vec![edge("a", "ghost")],
        };
        assert_eq!(
            def.validate(),
            Err(DagError::UnknownEdgeEndpoint("ghost".to_string()))
        );
    }
}
