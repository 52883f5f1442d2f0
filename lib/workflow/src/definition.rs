//! Workflow definition types.
//!
//! A workflow is a named automation owned by a user, consisting of:
//! - Metadata (name, description, active flag, timestamps)
//! - The editor's `nodes` and `edges` arrays
//! - A `version` counter bumped on every save
//! - Error alert configuration
//!
//! Every save snapshots the graph it replaces into a [`WorkflowVersion`],
//! which is what [`Workflow::rollback`] restores from.

use crate::edge::Edge;
use crate::error::VersionError;
use crate::node::{Node, NodeId, NodeType};
use chrono::{DateTime, Utc};
use flowforge_core::{UserId, WorkflowId, WorkflowVersionId};
use serde::{Deserialize, Serialize};

/// Where to send a notice when an execution of this workflow fails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorAlertConfig {
    /// Whether alerts are sent at all.
    #[serde(default)]
    pub enabled: bool,
    /// URL that receives a JSON POST per failed execution.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Attach the failed execution's input to the alert.
    #[serde(default)]
    pub include_input: bool,
}

impl ErrorAlertConfig {
    /// Returns the alert target if alerts are enabled and configured.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        if self.enabled {
            self.webhook_url.as_deref().filter(|u| !u.is_empty())
        } else {
            None
        }
    }
}

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Unique identifier for this workflow.
    pub id: WorkflowId,
    /// The owning user.
    pub owner_id: UserId,
    /// Human-readable name.
    pub name: String,
    /// What this workflow does.
    #[serde(default)]
    pub description: Option<String>,
    /// Graph vertices, in editor order.
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Graph connections, in editor order.
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Incremented on every save; starts at 1.
    pub version: u32,
    /// Whether schedule and webhook triggers fire.
    pub is_active: bool,
    /// Failure alerting.
    #[serde(default)]
    pub error_alerts: ErrorAlertConfig,
    /// When this workflow was created.
    pub created_at: DateTime<Utc>,
    /// When this workflow was last saved.
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Creates an empty, active workflow.
    #[must_use]
    pub fn new(owner_id: UserId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            owner_id,
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            version: 1,
            is_active: true,
            error_alerts: ErrorAlertConfig::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the initial graph without creating a snapshot.
    #[must_use]
    pub fn with_graph(mut self, nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        self.nodes = nodes;
        self.edges = edges;
        self
    }

    /// Sets the alert configuration.
    #[must_use]
    pub fn with_error_alerts(mut self, alerts: ErrorAlertConfig) -> Self {
        self.error_alerts = alerts;
        self
    }

    /// Installs a new graph, returning the snapshot of the graph it replaced.
    ///
    /// The snapshot's `version_num` is the version being replaced, so
    /// snapshot numbers strictly increase with every save.
    pub fn save_graph(
        &mut self,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
        author: Option<UserId>,
    ) -> WorkflowVersion {
        let snapshot = WorkflowVersion {
            id: WorkflowVersionId::new(),
            workflow_id: self.id,
            version_num: self.version,
            nodes: std::mem::replace(&mut self.nodes, nodes),
            edges: std::mem::replace(&mut self.edges, edges),
            created_by: author,
            created_at: Utc::now(),
        };
        self.version += 1;
        self.touch();
        snapshot
    }

    /// Restores the graph captured in `version`.
    ///
    /// The current graph is snapshotted first, so a rollback can itself be
    /// rolled back.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot belongs to another workflow.
    pub fn rollback(
        &mut self,
        version: &WorkflowVersion,
        author: Option<UserId>,
    ) -> Result<WorkflowVersion, VersionError> {
        if version.workflow_id != self.id {
            return Err(VersionError::WorkflowMismatch {
                expected: self.id,
                actual: version.workflow_id,
            });
        }
        Ok(self.save_graph(version.nodes.clone(), version.edges.clone(), author))
    }

    /// Activates schedule and webhook triggers.
    pub fn activate(&mut self) {
        self.is_active = true;
        self.touch();
    }

    /// Deactivates schedule and webhook triggers.
    pub fn deactivate(&mut self) {
        self.is_active = false;
        self.touch();
    }

    /// Returns the node with the given id.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Returns nodes whose type parses as `node_type`.
    pub fn nodes_of_type(&self, node_type: NodeType) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(move |n| n.kind().is_ok_and(|k| k == node_type))
    }

    /// Updates the modification timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A snapshot of a workflow's graph taken when it was overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowVersion {
    /// Unique identifier for this snapshot.
    pub id: WorkflowVersionId,
    /// The workflow this snapshot belongs to.
    pub workflow_id: WorkflowId,
    /// The workflow version this snapshot captured.
    pub version_num: u32,
    /// Captured nodes.
    pub nodes: Vec<Node>,
    /// Captured edges.
    pub edges: Vec<Edge>,
    /// Who saved over this graph.
    pub created_by: Option<UserId>,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
}

/// Summary of a workflow for listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub id: WorkflowId,
    pub name: String,
    pub version: u32,
    pub is_active: bool,
    pub node_count: usize,
    pub updated_at: DateTime<Utc>,
}

impl From<&Workflow> for WorkflowSummary {
    fn from(workflow: &Workflow) -> Self {
        Self {
            id: workflow.id,
            name: workflow.name.clone(),
            version: workflow.version,
            is_active: workflow.is_active,
            node_count: workflow.nodes.len(),
            updated_at: workflow.updated_at,
        }
    }
}
