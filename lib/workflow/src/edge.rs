//! Edge types for workflow graphs.
//!
//! An edge is a directed connection from a source node to a target node.
//! Edges leaving `if` and `switch` nodes carry a branch label that decides
//! which successors receive the source's output. Labels on edges leaving any
//! other node are ignored when the graph is built.

use crate::node::NodeId;
use serde::{Deserialize, Serialize};

/// A directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    /// Editor-assigned edge id, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The upstream node.
    #[serde(alias = "sourceNodeId")]
    pub source: NodeId,
    /// The downstream node.
    #[serde(alias = "targetNodeId")]
    pub target: NodeId,
    /// Branch label (`"true"`/`"false"` for `if`, a case output for `switch`).
    #[serde(
        default,
        alias = "sourceHandle",
        alias = "label",
        skip_serializing_if = "Option::is_none"
    )]
    pub branch: Option<String>,
}

impl Edge {
    /// Creates an unconditional edge.
    #[must_use]
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            id: None,
            source: source.into(),
            target: target.into(),
            branch: None,
        }
    }

    /// Creates an edge that only carries output tagged with `branch`.
    #[must_use]
    pub fn on_branch(
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            branch: Some(branch.into()),
            ..Self::new(source, target)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_editor_field_names() {
        let raw = json!({
            "id": "e1",
            "source": "if1",
            "target": "yes",
            "sourceHandle": "true"
        });
        let edge: Edge = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(edge.branch.as_deref(), Some("true"));
        assert_eq!(edge.source, NodeId::from("if1"));
    }

    #[test]
    fn accepts_node_id_field_names() {
        let raw = json!({ "sourceNodeId": "a", "targetNodeId": "b" });
        let edge: Edge = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(edge, Edge::new("a", "b"));
    }

    #[test]
    fn on_branch_sets_the_label() {
        let labeled = Edge::on_branch("if1", "yes", "true");
        assert_eq!(labeled.branch.as_deref(), Some("true"));
        assert_eq!(Edge::new("a", "b").branch, None);
    }
}
