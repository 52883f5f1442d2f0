//! Workflow model for flowforge.
//!
//! This crate holds everything about a workflow that does not perform I/O:
//!
//! - **Definition**: workflows, nodes, edges and version snapshots
//! - **Config**: typed, validated per-node-type configuration
//! - **Graph**: petgraph-backed validated graph
//! - **Planner**: cycle detection, entry discovery and leveling
//! - **Expressions**: sandboxed JavaScript for conditions, templates and code
//! - **Execution**: execution records, node runs and their state machine
//! - **Run state**: dispatch-time readiness and input assembly

pub mod config;
pub mod definition;
pub mod edge;
pub mod error;
pub mod execution;
pub mod expression;
pub mod graph;
pub mod node;
pub mod output;
pub mod planner;
pub mod run_state;
pub mod trigger;

pub use config::{HttpMethod, NodeConfig};
pub use definition::{ErrorAlertConfig, Workflow, WorkflowSummary, WorkflowVersion};
pub use edge::Edge;
pub use error::{GraphError, NodeError, NodeErrorKind, TransitionError, VersionError};
pub use execution::{
    Execution, ExecutionFailure, ExecutionMode, ExecutionStatus, ExecutionSummary, NodeRun,
    NodeRunStatus,
};
pub use graph::{PlannedNode, WorkflowGraph};
pub use node::{Node, NodeCategory, NodeId, NodeType};
pub use output::{Emission, NodeOutput};
pub use planner::{Schedule, plan};
pub use run_state::{Readiness, RunState};
pub use trigger::{Trigger, TriggerConfig, TriggerType};
