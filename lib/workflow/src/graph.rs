//! Workflow graph implementation using petgraph.
//!
//! A [`WorkflowGraph`] is the validated, typed form of a workflow's stored
//! `nodes`/`edges` arrays:
//! - every node has a known type and a config that matches its schema
//! - every edge references existing nodes
//! - comment nodes (and any edge touching one) are dropped
//! - branch labels survive only on edges leaving `if` and `switch` nodes
//!
//! Node indices follow the stored array order, which is what makes
//! planning deterministic.

use crate::config::NodeConfig;
use crate::definition::Workflow;
use crate::edge::Edge;
use crate::error::GraphError;
use crate::node::{Node, NodeId, NodeType};
use petgraph::Direction;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{HashMap, HashSet};

/// A node that passed type and config validation.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedNode {
    /// Editor-assigned id.
    pub id: NodeId,
    /// Label, falling back to the id.
    pub name: String,
    /// Parsed node type.
    pub node_type: NodeType,
    /// Typed configuration.
    pub config: NodeConfig,
    /// Explicitly marked as workflow output.
    pub is_output: bool,
    /// Position in the stored `nodes` array.
    pub order: usize,
}

/// A validated edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    /// Branch label, if any.
    pub branch: Option<String>,
    /// Position in the stored `edges` array.
    pub order: usize,
}

impl GraphEdge {
    /// Returns true if output tagged with `emitted` travels along this edge.
    ///
    /// Untagged output only travels along unlabeled edges; tagged output
    /// only travels along edges with the same label.
    #[must_use]
    pub fn carries(&self, emitted: Option<&str>) -> bool {
        self.branch.as_deref() == emitted
    }
}

/// A typed, validated workflow graph.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    graph: DiGraph<PlannedNode, GraphEdge>,
    node_index_map: HashMap<NodeId, NodeIndex>,
}

impl WorkflowGraph {
    /// Validates a workflow's stored graph.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate node ids, unknown node types, configs
    /// that do not match their type's schema, and edges that reference
    /// missing nodes.
    pub fn from_workflow(workflow: &Workflow) -> Result<Self, GraphError> {
        Self::build(&workflow.nodes, &workflow.edges)
    }

    /// Validates a stored node/edge list.
    ///
    /// # Errors
    ///
    /// See [`WorkflowGraph::from_workflow`].
    pub fn build(nodes: &[Node], edges: &[Edge]) -> Result<Self, GraphError> {
        let mut graph: DiGraph<PlannedNode, GraphEdge> =
            DiGraph::with_capacity(nodes.len(), edges.len());
        let mut node_index_map = HashMap::with_capacity(nodes.len());
        let mut seen = HashSet::with_capacity(nodes.len());
        let mut comments = HashSet::new();

        for (order, node) in nodes.iter().enumerate() {
            if !seen.insert(node.id.clone()) {
                return Err(GraphError::DuplicateNode {
                    node_id: node.id.clone(),
                });
            }

            let node_type = node.kind().map_err(|e| GraphError::UnknownNodeType {
                node_id: node.id.clone(),
                node_type: e.0,
            })?;

            if node_type == NodeType::Comment {
                comments.insert(node.id.clone());
                continue;
            }

            let config = NodeConfig::parse(node_type, &node.config).map_err(|message| {
                GraphError::InvalidConfig {
                    node_id: node.id.clone(),
                    message,
                }
            })?;

            let index = graph.add_node(PlannedNode {
                id: node.id.clone(),
                name: node.display_name().to_string(),
                node_type,
                config,
                is_output: node.is_output,
                order,
            });
            node_index_map.insert(node.id.clone(), index);
        }

        for (order, edge) in edges.iter().enumerate() {
            if comments.contains(&edge.source) || comments.contains(&edge.target) {
                continue;
            }

            let lookup = |id: &NodeId| {
                node_index_map
                    .get(id)
                    .copied()
                    .ok_or_else(|| GraphError::InvalidEdge {
                        source: edge.source.clone(),
                        target: edge.target.clone(),
                        missing: id.clone(),
                    })
            };
            let source = lookup(&edge.source)?;
            let target = lookup(&edge.target)?;

            // Editors put handle names on every edge; only branching nodes
            // tag their output, so any other label would block the edge.
            let branching = graph[source].node_type.is_branching();
            graph.add_edge(
                source,
                target,
                GraphEdge {
                    branch: edge.branch.clone().filter(|_| branching),
                    order,
                },
            );
        }

        Ok(Self {
            graph,
            node_index_map,
        })
    }

    /// Returns a node by id.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&PlannedNode> {
        let index = self.node_index_map.get(id)?;
        self.graph.node_weight(*index)
    }

    /// Returns all nodes in stored order.
    pub fn nodes(&self) -> impl Iterator<Item = &PlannedNode> {
        self.graph.node_weights()
    }

    /// Returns the number of executable nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of edges between executable nodes.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns the upstream nodes of `id` with their edges, in stored edge order.
    #[must_use]
    pub fn predecessors(&self, id: &NodeId) -> Vec<(&PlannedNode, &GraphEdge)> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Returns the downstream nodes of `id` with their edges, in stored edge order.
    #[must_use]
    pub fn successors(&self, id: &NodeId) -> Vec<(&PlannedNode, &GraphEdge)> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &NodeId, direction: Direction) -> Vec<(&PlannedNode, &GraphEdge)> {
        let Some(&index) = self.node_index_map.get(id) else {
            return Vec::new();
        };

        let mut found: Vec<_> = self
            .graph
            .edges_directed(index, direction)
            .filter_map(|edge| {
                let other = match direction {
                    Direction::Incoming => edge.source(),
                    Direction::Outgoing => edge.target(),
                };
                Some((self.graph.node_weight(other)?, edge.weight()))
            })
            .collect();
        found.sort_by_key(|(_, edge)| edge.order);
        found
    }

    pub(crate) fn inner(&self) -> &DiGraph<PlannedNode, GraphEdge> {
        &self.graph
    }

    pub(crate) fn index_of(&self, id: &NodeId) -> Option<NodeIndex> {
        self.node_index_map.get(id).copied()
    }

    pub(crate) fn edge_endpoints(&self, edge: EdgeIndex) -> Option<(&NodeId, &NodeId)> {
        let (source, target) = self.graph.edge_endpoints(edge)?;
        Some((
            &self.graph.node_weight(source)?.id,
            &self.graph.node_weight(target)?.id,
        ))
    }
}
