//! Dependency-ordered scheduling of a workflow graph.
//!
//! Planning turns a [`WorkflowGraph`] into levels of nodes:
//! - level 0 holds the entry trigger(s)
//! - a node sits one level below its deepest scheduled predecessor
//! - nodes in a level keep their stored order
//!
//! Edges that close a cycle through a `loop` node are treated as loop
//! feedback and ignored for ordering. Any other cycle fails planning.
//! Nodes that cannot be reached from an entry are left out of the schedule.
//!
//! Leveling is advisory: the runner still decides at dispatch time whether a
//! node's taken predecessors have all completed.

use crate::error::GraphError;
use crate::graph::WorkflowGraph;
use crate::node::{NodeId, NodeType};
use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// The result of planning a workflow graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    /// The trigger node(s) the run starts from.
    pub entries: Vec<NodeId>,
    /// Scheduled nodes grouped by level.
    pub levels: Vec<Vec<NodeId>>,
    /// Nodes unreachable from every entry; never executed.
    pub excluded: Vec<NodeId>,
    /// Scheduled nodes whose output forms the execution output.
    pub terminals: Vec<NodeId>,
    feedback: HashSet<(NodeId, NodeId)>,
    level_index: HashMap<NodeId, usize>,
}

impl Schedule {
    /// Returns the level a node was scheduled at.
    #[must_use]
    pub fn level_of(&self, id: &NodeId) -> Option<usize> {
        self.level_index.get(id).copied()
    }

    /// Returns true if the node will be considered for dispatch.
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.level_index.contains_key(id)
    }

    /// Returns true if `source -> target` closes a loop and carries no data.
    #[must_use]
    pub fn is_feedback(&self, source: &NodeId, target: &NodeId) -> bool {
        self.feedback.contains(&(source.clone(), target.clone()))
    }

    /// Returns all scheduled nodes in dispatch order.
    pub fn ordered(&self) -> impl Iterator<Item = &NodeId> {
        self.levels.iter().flatten()
    }

    /// Returns the number of scheduled nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.level_index.len()
    }

    /// Returns true if nothing was scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.level_index.is_empty()
    }
}

/// Plans the execution order of `graph`.
///
/// When `fired_trigger` is given the run starts from exactly that node;
/// otherwise every trigger node without incoming edges is an entry.
///
/// # Errors
///
/// - [`GraphError::CycleDetected`] if a cycle does not pass through a `loop` node
/// - [`GraphError::UnknownTrigger`] if `fired_trigger` is missing or not a trigger
/// - [`GraphError::NoEntryNode`] if there is nothing to start from
pub fn plan(graph: &WorkflowGraph, fired_trigger: Option<&NodeId>) -> Result<Schedule, GraphError> {
    let skeleton = acyclic_skeleton(graph)?;
    let inner = graph.inner();

    let entries: Vec<NodeIndex> = match fired_trigger {
        Some(id) => {
            let index = graph
                .index_of(id)
                .filter(|&idx| inner[idx].node_type.is_trigger())
                .ok_or_else(|| GraphError::UnknownTrigger {
                    node_id: id.clone(),
                })?;
            vec![index]
        }
        None => inner
            .node_indices()
            .filter(|&idx| inner[idx].node_type.is_trigger())
            .filter(|&idx| {
                skeleton
                    .edges_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect(),
    };
    if entries.is_empty() {
        return Err(GraphError::NoEntryNode);
    }

    // Breadth-first reachability from the entries.
    let mut reachable: HashSet<NodeIndex> = entries.iter().copied().collect();
    let mut queue: VecDeque<NodeIndex> = entries.iter().copied().collect();
    while let Some(idx) = queue.pop_front() {
        for next in skeleton.neighbors_directed(idx, Direction::Outgoing) {
            if reachable.insert(next) {
                queue.push_back(next);
            }
        }
    }

    // Longest-path leveling over the reachable, acyclic part of the graph.
    let mut in_degree: HashMap<NodeIndex, usize> = reachable
        .iter()
        .map(|&idx| {
            let count = skeleton
                .edges_directed(idx, Direction::Incoming)
                .filter(|e| reachable.contains(&e.source()))
                .count();
            (idx, count)
        })
        .collect();
    let mut level: HashMap<NodeIndex, usize> = HashMap::with_capacity(reachable.len());
    let mut ready: BTreeSet<NodeIndex> = in_degree
        .iter()
        .filter(|&(_, &count)| count == 0)
        .map(|(&idx, _)| idx)
        .collect();
    for &idx in &ready {
        level.insert(idx, 0);
    }

    while let Some(idx) = ready.pop_first() {
        let current = level.get(&idx).copied().unwrap_or(0);
        for edge in skeleton.edges_directed(idx, Direction::Outgoing) {
            let next = edge.target();
            let Some(count) = in_degree.get_mut(&next) else {
                continue;
            };
            let slot = level.entry(next).or_insert(0);
            *slot = (*slot).max(current + 1);
            *count -= 1;
            if *count == 0 {
                ready.insert(next);
            }
        }
    }

    let depth = level.values().copied().max().map_or(0, |max| max + 1);
    let mut levels: Vec<Vec<NodeIndex>> = vec![Vec::new(); depth];
    for (&idx, &lvl) in &level {
        levels[lvl].push(idx);
    }
    // NodeIndex order is stored order.
    for group in &mut levels {
        group.sort();
    }

    let terminals = inner
        .node_indices()
        .filter(|idx| reachable.contains(idx))
        .filter(|&idx| {
            inner[idx].is_output || inner.edges_directed(idx, Direction::Outgoing).next().is_none()
        })
        .map(|idx| inner[idx].id.clone())
        .collect();

    let excluded = inner
        .node_indices()
        .filter(|idx| !reachable.contains(idx))
        .map(|idx| inner[idx].id.clone())
        .collect();

    let feedback = inner
        .edge_indices()
        .filter(|&e| {
            inner
                .edge_endpoints(e)
                .is_some_and(|(s, t)| !skeleton.contains_edge(s, t))
        })
        .filter_map(|e| graph.edge_endpoints(e))
        .map(|(s, t)| (s.clone(), t.clone()))
        .collect();

    let levels: Vec<Vec<NodeId>> = levels
        .into_iter()
        .map(|group| group.into_iter().map(|idx| inner[idx].id.clone()).collect())
        .collect();
    let level_index = levels
        .iter()
        .enumerate()
        .flat_map(|(lvl, group)| group.iter().map(move |id| (id.clone(), lvl)))
        .collect();

    Ok(Schedule {
        entries: entries.iter().map(|&idx| inner[idx].id.clone()).collect(),
        levels,
        excluded,
        terminals,
        feedback,
        level_index,
    })
}

/// Returns a copy of the graph's topology with loop feedback edges removed.
///
/// Node indices match the source graph.
fn acyclic_skeleton(graph: &WorkflowGraph) -> Result<DiGraph<(), ()>, GraphError> {
    let inner = graph.inner();
    let mut skeleton: DiGraph<(), ()> =
        DiGraph::with_capacity(inner.node_count(), inner.edge_count());
    for _ in inner.node_indices() {
        skeleton.add_node(());
    }
    for edge in inner.edge_references() {
        if !skeleton.contains_edge(edge.source(), edge.target()) {
            skeleton.add_edge(edge.source(), edge.target(), ());
        }
    }

    loop {
        let mut offending: Vec<NodeIndex> = Vec::new();
        let mut feedback = Vec::new();

        for component in tarjan_scc(&skeleton) {
            let cyclic = component.len() > 1
                || component
                    .first()
                    .is_some_and(|&idx| skeleton.contains_edge(idx, idx));
            if !cyclic {
                continue;
            }

            let members: HashSet<NodeIndex> = component.iter().copied().collect();
            let loops: Vec<NodeIndex> = component
                .iter()
                .copied()
                .filter(|&idx| inner[idx].node_type == NodeType::Loop)
                .collect();
            if loops.is_empty() {
                offending.extend(component);
                continue;
            }

            for &loop_idx in &loops {
                for edge in skeleton.edges_directed(loop_idx, Direction::Incoming) {
                    if members.contains(&edge.source()) {
                        feedback.push(edge.id());
                    }
                }
            }
        }

        if !offending.is_empty() {
            offending.sort();
            return Err(GraphError::CycleDetected {
                nodes: offending
                    .into_iter()
                    .map(|idx| inner[idx].id.clone())
                    .collect(),
            });
        }
        if feedback.is_empty() {
            return Ok(skeleton);
        }

        // Removing an edge invalidates the last edge index, so go high to low.
        feedback.sort();
        feedback.dedup();
        for edge in feedback.into_iter().rev() {
            skeleton.remove_edge(edge);
        }
    }
}
