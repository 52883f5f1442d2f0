//! Per-execution readiness tracking.
//!
//! The planner's levels say which nodes *may* run in which order; this module
//! decides, at dispatch time, whether a node actually runs:
//! - a node whose taken predecessors have all finished is ready
//! - a node none of whose incoming edges was taken is skipped, and the skip
//!   propagates to anything that depended on it alone
//! - a node waiting on an unfinished predecessor is blocked
//!
//! It also assembles each node's ordered input list from the emissions that
//! travelled along its taken edges.

use crate::graph::WorkflowGraph;
use crate::node::NodeId;
use crate::output::NodeOutput;
use crate::planner::Schedule;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;

/// What happened to a node so far.
#[derive(Debug, Clone, PartialEq)]
enum NodeState {
    Completed(NodeOutput),
    Skipped,
    Failed,
}

/// The outcome of checking a node at dispatch time.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    /// Run the node once per entry; each entry is an ordered input list.
    Dispatch(Vec<Vec<JsonValue>>),
    /// No incoming edge was taken.
    Skip,
    /// A predecessor has not finished (or failed).
    Blocked,
}

/// Tracks node outcomes for one execution.
#[derive(Debug, Clone)]
pub struct RunState {
    trigger_payload: JsonValue,
    states: HashMap<NodeId, NodeState>,
}

impl RunState {
    /// Creates an empty state for a run started with `trigger_payload`.
    #[must_use]
    pub fn new(trigger_payload: JsonValue) -> Self {
        Self {
            trigger_payload,
            states: HashMap::new(),
        }
    }

    pub fn mark_completed(&mut self, node_id: NodeId, output: NodeOutput) {
        self.states.insert(node_id, NodeState::Completed(output));
    }

    pub fn mark_skipped(&mut self, node_id: NodeId) {
        self.states.insert(node_id, NodeState::Skipped);
    }

    pub fn mark_failed(&mut self, node_id: NodeId) {
        self.states.insert(node_id, NodeState::Failed);
    }

    #[must_use]
    pub fn output(&self, node_id: &NodeId) -> Option<&NodeOutput> {
        match self.states.get(node_id) {
            Some(NodeState::Completed(output)) => Some(output),
            _ => None,
        }
    }

    /// Decides whether `node_id` can run now and with which inputs.
    ///
    /// Entry nodes receive the trigger payload as their only input.
    #[must_use]
    pub fn readiness(&self, graph: &WorkflowGraph, schedule: &Schedule, node_id: &NodeId) -> Readiness {
        if schedule.entries.contains(node_id) {
            return Readiness::Dispatch(vec![vec![self.trigger_payload.clone()]]);
        }

        let mut fixed: Vec<JsonValue> = Vec::new();
        let mut fanned: Vec<Vec<JsonValue>> = Vec::new();
        // Position of each multiplexed edge within the ordered input list.
        let mut slots: Vec<usize> = Vec::new();
        let mut taken = false;

        for (predecessor, edge) in graph.predecessors(node_id) {
            if !schedule.contains(&predecessor.id) || schedule.is_feedback(&predecessor.id, node_id) {
                continue;
            }
            match self.states.get(&predecessor.id) {
                None | Some(NodeState::Failed) => return Readiness::Blocked,
                Some(NodeState::Skipped) => {}
                Some(NodeState::Completed(output)) => {
                    let delivered = output.delivered(edge);
                    if delivered.is_empty() {
                        continue;
                    }
                    taken = true;
                    if output.is_multiplexed() {
                        slots.push(fixed.len());
                        fixed.push(JsonValue::Null);
                        fanned.push(delivered.into_iter().cloned().collect());
                    } else {
                        fixed.extend(delivered.into_iter().cloned());
                    }
                }
            }
        }

        if !taken {
            return Readiness::Skip;
        }
        if fanned.is_empty() {
            return Readiness::Dispatch(vec![fixed]);
        }

        let rounds = fanned.iter().map(Vec::len).min().unwrap_or(0);
        let invocations = (0..rounds)
            .map(|round| {
                let mut inputs = fixed.clone();
                for (slot, values) in slots.iter().zip(&fanned) {
                    inputs[*slot] = values[round].clone();
                }
                inputs
            })
            .collect();
        Readiness::Dispatch(invocations)
    }

    /// Outputs of every completed node, keyed by node id, for `$node.<id>`.
    #[must_use]
    pub fn outputs_by_id(&self) -> HashMap<String, JsonValue> {
        self.states
            .iter()
            .filter_map(|(id, state)| match state {
                NodeState::Completed(output) => Some((id.to_string(), output.to_json())),
                _ => None,
            })
            .collect()
    }

    /// The execution's `outputData`.
    ///
    /// With one completed terminal node this is that node's output; with
    /// several it is an object keyed by node id. Skipped terminals and
    /// unscheduled nodes never contribute.
    #[must_use]
    pub fn terminal_output(&self, schedule: &Schedule) -> JsonValue {
        let completed: Vec<(&NodeId, JsonValue)> = schedule
            .terminals
            .iter()
            .filter_map(|id| self.output(id).map(|output| (id, output.to_json())))
            .collect();

        match completed.as_slice() {
            [] => JsonValue::Null,
            [(_, value)] => value.clone(),
            many => JsonValue::Object(
                many.iter()
                    .map(|(id, value)| (id.to_string(), value.clone()))
                    .collect::<Map<_, _>>(),
            ),
        }
    }
}
