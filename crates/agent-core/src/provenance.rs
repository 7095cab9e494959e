//! Node Provenance
//!
//! Every agent, tool and utility execution inside a run is a node. Nodes live
//! in an arena owned by the run and refer to their parent by id, so the
//! lineage is a tree rooted at the run's agent node.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::identity::IdentityContext;

/// Unique node identifier (unique within a run)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of execution unit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Agent,
    Tool,
    Utility,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Tool => write!(f, "tool"),
            Self::Utility => write!(f, "utility"),
        }
    }
}

/// One node of the provenance tree
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionNode {
    pub id: NodeId,
    pub node_type: NodeType,
    pub parent_id: Option<NodeId>,
    pub parent_type: Option<NodeType>,
    pub identity: IdentityContext,
    pub created_at: DateTime<Utc>,
}

impl ExecutionNode {
    pub const fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Arena of nodes for a single run
#[derive(Debug)]
pub struct NodeGraph {
    nodes: Vec<ExecutionNode>,
    index: HashMap<NodeId, usize>,
}

impl NodeGraph {
    /// Start a graph with the run's root agent node
    pub fn root(identity: IdentityContext) -> Self {
        let root = ExecutionNode {
            id: NodeId::new(),
            node_type: NodeType::Agent,
            parent_id: None,
            parent_type: None,
            identity,
            created_at: Utc::now(),
        };
        let mut index = HashMap::new();
        index.insert(root.id.clone(), 0);
        Self {
            nodes: vec![root],
            index,
        }
    }

    pub fn root_node(&self) -> &ExecutionNode {
        &self.nodes[0]
    }

    /// Mint a child of `parent`. The child inherits the parent's identity.
    pub fn mint_child(&mut self, parent: &NodeId, node_type: NodeType) -> Result<&ExecutionNode> {
        if node_type == NodeType::Agent {
            return Err(AgentError::Provenance(
                "only the root node may be an agent node".into(),
            ));
        }
        let parent = self
            .get(parent)
            .ok_or_else(|| AgentError::Provenance(format!("unknown parent node {parent}")))?;

        let child = ExecutionNode {
            id: NodeId::new(),
            node_type,
            parent_id: Some(parent.id.clone()),
            parent_type: Some(parent.node_type),
            identity: parent.identity.clone(),
            created_at: Utc::now(),
        };

        let slot = self.nodes.len();
        self.index.insert(child.id.clone(), slot);
        self.nodes.push(child);
        Ok(&self.nodes[slot])
    }

    pub fn get(&self, id: &NodeId) -> Option<&ExecutionNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn parent(&self, id: &NodeId) -> Option<&ExecutionNode> {
        self.get(id)?.parent_id.as_ref().and_then(|p| self.get(p))
    }

    pub fn children(&self, id: &NodeId) -> Vec<&ExecutionNode> {
        self.nodes
            .iter()
            .filter(|n| n.parent_id.as_ref() == Some(id))
            .collect()
    }

    /// Path from `id` up to the root, inclusive
    pub fn lineage(&self, id: &NodeId) -> Vec<&ExecutionNode> {
        let mut path = Vec::new();
        let mut cursor = self.get(id);
        while let Some(node) = cursor {
            path.push(node);
            cursor = node.parent_id.as_ref().and_then(|p| self.get(p));
        }
        path
    }

    pub fn nodes(&self) -> &[ExecutionNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// A graph always holds its root
    pub const fn is_empty(&self) -> bool {
        false
    }
}

/// Shared handle to a run's graph, handed to executors so nested calls can
/// extend the lineage.
#[derive(Clone, Debug)]
pub struct ProvenanceHandle(Arc<Mutex<NodeGraph>>);

impl ProvenanceHandle {
    pub fn new(graph: NodeGraph) -> Self {
        Self(Arc::new(Mutex::new(graph)))
    }

    pub fn root_node(&self) -> ExecutionNode {
        self.0.lock().root_node().clone()
    }

    pub fn mint_child(&self, parent: &NodeId, node_type: NodeType) -> Result<ExecutionNode> {
        self.0.lock().mint_child(parent, node_type).cloned()
    }

    pub fn get(&self, id: &NodeId) -> Option<ExecutionNode> {
        self.0.lock().get(id).cloned()
    }

    pub fn snapshot(&self) -> Vec<ExecutionNode> {
        self.0.lock().nodes().to_vec()
    }
}
