//! Error types for the workflow crate.
//!
//! - `GraphError`: planning-time failures; an execution that hits one goes
//!   straight from PENDING to ERROR before any node runs
//! - `NodeError`: execution-time failures raised by a single node
//! - `TransitionError`: illegal execution state machine moves
//! - `VersionError`: workflow snapshot/rollback failures

use crate::execution::ExecutionStatus;
use crate::node::NodeId;
use flowforge_core::WorkflowId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Errors detected while turning a stored graph into a schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Nodes that can never be assigned a level because they sit on a cycle
    /// with no `loop` node in it.
    CycleDetected { nodes: Vec<NodeId> },
    /// No trigger node can start the run.
    NoEntryNode,
    /// The requested trigger does not exist or is not a trigger node.
    UnknownTrigger { node_id: NodeId },
    /// An edge references a node that does not exist.
    InvalidEdge {
        source: NodeId,
        target: NodeId,
        missing: NodeId,
    },
    /// Two nodes share the same id.
    DuplicateNode { node_id: NodeId },
    /// The node's `type` is not one of the supported kinds.
    UnknownNodeType { node_id: NodeId, node_type: String },
    /// The node's config does not match the schema for its type.
    InvalidConfig { node_id: NodeId, message: String },
    /// The node type is known but no executor is registered for it.
    UnsupportedNodeType { node_id: NodeId, node_type: String },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CycleDetected { nodes } => {
                let names: Vec<_> = nodes.iter().map(NodeId::as_str).collect();
                write!(f, "cycle detected between nodes: {}", names.join(", "))
            }
            Self::NoEntryNode => write!(f, "workflow has no trigger node to start from"),
            Self::UnknownTrigger { node_id } => {
                write!(f, "node {node_id} is not a trigger of this workflow")
            }
            Self::InvalidEdge {
                source,
                target,
                missing,
            } => {
                write!(
                    f,
                    "edge {source} -> {target} references missing node {missing}"
                )
            }
            Self::DuplicateNode { node_id } => write!(f, "duplicate node id: {node_id}"),
            Self::UnknownNodeType { node_id, node_type } => {
                write!(f, "node {node_id} has unknown type '{node_type}'")
            }
            Self::InvalidConfig { node_id, message } => {
                write!(f, "node {node_id} has invalid config: {message}")
            }
            Self::UnsupportedNodeType { node_id, node_type } => {
                write!(f, "no executor registered for node {node_id} of type '{node_type}'")
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Classification of a node failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeErrorKind {
    /// Config is missing a field or has the wrong shape.
    ConfigInvalid,
    /// The node did not finish within its time budget.
    Timeout,
    /// An external service failed.
    UpstreamServiceError,
    /// An external service refused the call because of rate limits.
    RateLimited,
    /// The referenced credential does not exist or cannot be decrypted.
    CredentialNotFound,
    /// An `if`/`filter`/`switch` expression could not be evaluated.
    EvaluationError,
}

impl NodeErrorKind {
    /// Whether failures of this kind are transient by default.
    #[must_use]
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::UpstreamServiceError | Self::RateLimited
        )
    }

    /// Returns the wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::Timeout => "TIMEOUT",
            Self::UpstreamServiceError => "UPSTREAM_SERVICE_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::CredentialNotFound => "CREDENTIAL_NOT_FOUND",
            Self::EvaluationError => "EVALUATION_ERROR",
        }
    }
}

impl fmt::Display for NodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure raised while executing a single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeError {
    /// The node that failed.
    pub node_id: NodeId,
    /// What went wrong.
    pub kind: NodeErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// Whether the runner may re-attempt the node.
    pub retryable: bool,
}

impl NodeError {
    /// Creates an error whose retryability follows the kind's default.
    #[must_use]
    pub fn new(node_id: NodeId, kind: NodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            node_id,
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
        }
    }

    /// Invalid or missing configuration.
    #[must_use]
    pub fn config_invalid(node_id: NodeId, message: impl Into<String>) -> Self {
        Self::new(node_id, NodeErrorKind::ConfigInvalid, message)
    }

    /// The node exceeded its time budget.
    #[must_use]
    pub fn timeout(node_id: NodeId, after: Duration) -> Self {
        Self::new(
            node_id,
            NodeErrorKind::Timeout,
            format!("timed out after {}ms", after.as_millis()),
        )
    }

    /// An external call failed; the caller decides whether it is transient.
    #[must_use]
    pub fn upstream(node_id: NodeId, message: impl Into<String>, retryable: bool) -> Self {
        Self::new(node_id, NodeErrorKind::UpstreamServiceError, message).with_retryable(retryable)
    }

    /// An external service rate limited the call.
    #[must_use]
    pub fn rate_limited(node_id: NodeId, message: impl Into<String>) -> Self {
        Self::new(node_id, NodeErrorKind::RateLimited, message)
    }

    /// A referenced credential could not be resolved.
    #[must_use]
    pub fn credential_not_found(node_id: NodeId, message: impl Into<String>) -> Self {
        Self::new(node_id, NodeErrorKind::CredentialNotFound, message)
    }

    /// An expression failed to parse or evaluate.
    #[must_use]
    pub fn evaluation(node_id: NodeId, message: impl Into<String>) -> Self {
        Self::new(node_id, NodeErrorKind::EvaluationError, message)
    }

    /// Overrides the retryable flag.
    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} failed ({}): {}", self.node_id, self.kind, self.message)
    }
}

impl std::error::Error for NodeError {}

/// An illegal move in the execution state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid state transition from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

/// Errors from workflow snapshot and rollback operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// No snapshot with that number exists for the workflow.
    VersionNotFound {
        workflow_id: WorkflowId,
        version_num: u32,
    },
    /// The snapshot belongs to a different workflow.
    WorkflowMismatch {
        expected: WorkflowId,
        actual: WorkflowId,
    },
}

impl fmt::Display for VersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VersionNotFound {
                workflow_id,
                version_num,
            } => write!(f, "version {version_num} of workflow {workflow_id} not found"),
            Self::WorkflowMismatch { expected, actual } => {
                write!(f, "version belongs to workflow {actual}, not {expected}")
            }
        }
    }
}

impl std::error::Error for VersionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_names_nodes() {
        let err = GraphError::CycleDetected {
            nodes: vec![NodeId::from("a"), NodeId::from("b")],
        };
        assert!(err.to_string().contains("a, b"));
    }

    #[test]
    fn invalid_edge_display() {
        let err = GraphError::InvalidEdge {
            source: NodeId::from("a"),
            target: NodeId::from("ghost"),
            missing: NodeId::from("ghost"),
        };
        assert!(err.to_string().contains("missing node ghost"));
    }

    #[test]
    fn retryable_defaults_follow_kind() {
        let node = NodeId::from("n");
        assert!(NodeError::timeout(node.clone(), Duration::from_secs(1)).retryable);
        assert!(NodeError::rate_limited(node.clone(), "slow down").retryable);
        assert!(!NodeError::config_invalid(node.clone(), "missing url").retryable);
        assert!(!NodeError::evaluation(node.clone(), "bad expr").retryable);
        assert!(!NodeError::credential_not_found(node.clone(), "gone").retryable);
        assert!(!NodeError::upstream(node, "404", false).retryable);
    }

    #[test]
    fn node_error_serializes_kind_in_screaming_case() {
        let err = NodeError::timeout(NodeId::from("n"), Duration::from_millis(5));
        let json = serde_json::to_value(&err).expect("serialize");
        assert_eq!(json["kind"], "TIMEOUT");
        assert_eq!(json["nodeId"], "n");
        assert_eq!(json["retryable"], true);
    }

    #[test]
    fn transition_error_display() {
        let err = TransitionError {
            from: ExecutionStatus::Success,
            to: ExecutionStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "invalid state transition from SUCCESS to RUNNING"
        );
    }
}
