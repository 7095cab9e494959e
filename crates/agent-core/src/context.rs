//! Execution Context
//!
//! What an executor sees when it is invoked: the node it runs as, the
//! identity scoped to that node, and the conversation it belongs to.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::identity::IdentityContext;
use crate::provenance::{ExecutionNode, NodeId, NodeType, ProvenanceHandle};
use crate::thread::ConversationId;

/// Unique run identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-call context passed to a utility executor
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub run_id: RunId,
    pub conversation_id: ConversationId,
    pub node: ExecutionNode,
    graph: ProvenanceHandle,
}

impl ExecutionContext {
    pub const fn new(
        run_id: RunId,
        conversation_id: ConversationId,
        node: ExecutionNode,
        graph: ProvenanceHandle,
    ) -> Self {
        Self {
            run_id,
            conversation_id,
            node,
            graph,
        }
    }

    pub const fn identity(&self) -> &IdentityContext {
        &self.node.identity
    }

    pub const fn node_id(&self) -> &NodeId {
        &self.node.id
    }

    /// Context for a nested call made by this node
    pub fn child(&self, node_type: NodeType) -> Result<Self> {
        let node = self.graph.mint_child(&self.node.id, node_type)?;
        Ok(Self {
            run_id: self.run_id.clone(),
            conversation_id: self.conversation_id.clone(),
            node,
            graph: self.graph.clone(),
        })
    }

    /// Identity and lineage rendered as outbound request headers
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let identity = self.identity();
        let mut headers = vec![
            ("x-user-id", identity.user_id.clone()),
            ("x-conversation-id", self.conversation_id.to_string()),
            ("x-run-id", self.run_id.to_string()),
            ("x-node-id", self.node.id.to_string()),
            ("x-node-type", self.node.node_type.to_string()),
        ];
        if let Some(org) = &identity.organization_id {
            headers.push(("x-organization-id", org.clone()));
        }
        if let Some(platform_user) = &identity.platform_user_id {
            headers.push(("x-platform-user-id", platform_user.clone()));
        }
        if let Some(credential) = &identity.platform_credential {
            headers.push(("authorization", format!("Bearer {}", credential.expose())));
        }
        if let Some(parent) = &self.node.parent_id {
            headers.push(("x-parent-node-id", parent.to_string()));
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provenance::NodeGraph;

    fn context() -> ExecutionContext {
        let graph = NodeGraph::root(
            IdentityContext::new("u1")
                .with_organization("o1")
                .with_credential("tok"),
        );
        let handle = ProvenanceHandle::new(graph);
        let root = handle.root_node();
        let tool = handle.mint_child(&root.id, NodeType::Tool).unwrap();
        ExecutionContext::new(RunId::new(), ConversationId::new(), tool, handle)
    }

    #[test]
    fn headers_carry_identity_and_lineage() {
        let ctx = context();
        let headers = ctx.headers();
        let get = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.clone())
        };

        assert_eq!(get("x-user-id").as_deref(), Some("u1"));
        assert_eq!(get("x-organization-id").as_deref(), Some("o1"));
        assert_eq!(get("authorization").as_deref(), Some("Bearer tok"));
        assert_eq!(get("x-node-type").as_deref(), Some("tool"));
        assert!(get("x-parent-node-id").is_some());
        assert!(get("x-platform-user-id").is_none());
    }

    #[test]
    fn child_context_extends_lineage() {
        let ctx = context();
        let nested = ctx.child(NodeType::Utility).unwrap();
        assert_eq!(nested.node.parent_id.as_ref(), Some(ctx.node_id()));
        assert_eq!(nested.identity(), ctx.identity());
        assert_eq!(nested.run_id, ctx.run_id);
    }
}
