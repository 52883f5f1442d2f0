//! Workflow node types.
//!
//! Nodes are stored exactly as the editor serializes them: an id, a `type`
//! string and a free-form JSON `config`. Nothing about a stored node is
//! validated on save; [`NodeType`] and [`crate::config::NodeConfig`] give
//! the node its meaning when the workflow is planned.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

/// Identifier of a node, unique within its workflow.
///
/// Node ids are assigned by the editor, so they are plain strings rather
/// than ULIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id from any string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Broad grouping of node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    /// Entry points that start an execution.
    Trigger,
    /// Calls to an external service.
    Integration,
    /// Pure data manipulation.
    Transform,
    /// Branching, iteration, joins and suspension.
    ControlFlow,
    /// Editor annotations with no runtime behavior.
    Annotation,
}

/// The closed set of node kinds the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    #[serde(rename = "manual-trigger")]
    ManualTrigger,
    #[serde(rename = "webhook-trigger")]
    WebhookTrigger,
    #[serde(rename = "schedule-trigger")]
    ScheduleTrigger,
    #[serde(rename = "http-request")]
    HttpRequest,
    #[serde(rename = "code")]
    Code,
    #[serde(rename = "email")]
    Email,
    #[serde(rename = "slack")]
    Slack,
    #[serde(rename = "database")]
    Database,
    #[serde(rename = "if")]
    If,
    #[serde(rename = "switch")]
    Switch,
    #[serde(rename = "loop")]
    Loop,
    #[serde(rename = "filter")]
    Filter,
    #[serde(rename = "set")]
    Set,
    #[serde(rename = "sort")]
    Sort,
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "google_sheets")]
    GoogleSheets,
    #[serde(rename = "github")]
    Github,
    #[serde(rename = "notion")]
    Notion,
    #[serde(rename = "wait")]
    Wait,
    #[serde(rename = "stripe")]
    Stripe,
    #[serde(rename = "twilio")]
    Twilio,
    #[serde(rename = "sub-workflow")]
    SubWorkflow,
    #[serde(rename = "merge")]
    Merge,
    #[serde(rename = "comment")]
    Comment,
}

impl NodeType {
    /// Every node type, in declaration order.
    pub const ALL: [NodeType; 24] = [
        Self::ManualTrigger,
        Self::WebhookTrigger,
        Self::ScheduleTrigger,
        Self::HttpRequest,
        Self::Code,
        Self::Email,
        Self::Slack,
        Self::Database,
        Self::If,
        Self::Switch,
        Self::Loop,
        Self::Filter,
        Self::Set,
        Self::Sort,
        Self::OpenAi,
        Self::GoogleSheets,
        Self::Github,
        Self::Notion,
        Self::Wait,
        Self::Stripe,
        Self::Twilio,
        Self::SubWorkflow,
        Self::Merge,
        Self::Comment,
    ];

    /// Returns the canonical wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualTrigger => "manual-trigger",
            Self::WebhookTrigger => "webhook-trigger",
            Self::ScheduleTrigger => "schedule-trigger",
            Self::HttpRequest => "http-request",
            Self::Code => "code",
            Self::Email => "email",
            Self::Slack => "slack",
            Self::Database => "database",
            Self::If => "if",
            Self::Switch => "switch",
            Self::Loop => "loop",
            Self::Filter => "filter",
            Self::Set => "set",
            Self::Sort => "sort",
            Self::OpenAi => "openai",
            Self::GoogleSheets => "google_sheets",
            Self::Github => "github",
            Self::Notion => "notion",
            Self::Wait => "wait",
            Self::Stripe => "stripe",
            Self::Twilio => "twilio",
            Self::SubWorkflow => "sub-workflow",
            Self::Merge => "merge",
            Self::Comment => "comment",
        }
    }

    /// Returns the category of this node type.
    #[must_use]
    pub fn category(&self) -> NodeCategory {
        match self {
            Self::ManualTrigger | Self::WebhookTrigger | Self::ScheduleTrigger => {
                NodeCategory::Trigger
            }
            Self::HttpRequest
            | Self::Email
            | Self::Slack
            | Self::Database
            | Self::OpenAi
            | Self::GoogleSheets
            | Self::Github
            | Self::Notion
            | Self::Stripe
            | Self::Twilio => NodeCategory::Integration,
            Self::Code | Self::Set | Self::Sort | Self::Filter => NodeCategory::Transform,
            Self::If
            | Self::Switch
            | Self::Loop
            | Self::Wait
            | Self::SubWorkflow
            | Self::Merge => NodeCategory::ControlFlow,
            Self::Comment => NodeCategory::Annotation,
        }
    }

    /// Returns true for manual, webhook and schedule triggers.
    #[must_use]
    pub fn is_trigger(&self) -> bool {
        self.category() == NodeCategory::Trigger
    }

    /// Returns true for node types that emit a branch tag with their output.
    #[must_use]
    pub fn is_branching(&self) -> bool {
        matches!(self, Self::If | Self::Switch)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for a `type` string that names no known node kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownNodeType(pub String);

impl fmt::Display for UnknownNodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown node type '{}'", self.0)
    }
}

impl std::error::Error for UnknownNodeType {}

impl FromStr for NodeType {
    type Err = UnknownNodeType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let node_type = match s {
            "manual-trigger" | "manual" | "manualTrigger" => Self::ManualTrigger,
            "webhook-trigger" | "webhook" | "webhookTrigger" => Self::WebhookTrigger,
            "schedule-trigger" | "schedule" | "scheduleTrigger" => Self::ScheduleTrigger,
            "http-request" | "http" | "httpRequest" => Self::HttpRequest,
            "code" => Self::Code,
            "email" => Self::Email,
            "slack" => Self::Slack,
            "database" => Self::Database,
            "if" => Self::If,
            "switch" => Self::Switch,
            "loop" => Self::Loop,
            "filter" => Self::Filter,
            "set" => Self::Set,
            "sort" => Self::Sort,
            "openai" => Self::OpenAi,
            "google_sheets" | "google-sheets" | "googleSheets" => Self::GoogleSheets,
            "github" => Self::Github,
            "notion" => Self::Notion,
            "wait" => Self::Wait,
            "stripe" => Self::Stripe,
            "twilio" => Self::Twilio,
            "sub-workflow" | "subworkflow" | "subWorkflow" => Self::SubWorkflow,
            "merge" => Self::Merge,
            "comment" | "note" => Self::Comment,
            other => return Err(UnknownNodeType(other.to_string())),
        };
        Ok(node_type)
    }
}

/// Editor canvas coordinates; carried through but never interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A workflow node as stored in the workflow's `nodes` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique identifier for this node within the workflow.
    pub id: NodeId,
    /// The declared node type, validated at plan time.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Human-readable label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Type-specific configuration.
    #[serde(default)]
    pub config: JsonValue,
    /// Canvas position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Include this node's output in the execution output even when it has
    /// successors.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_output: bool,
}

impl Node {
    /// Creates a node of a known type.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, node_type: NodeType, config: JsonValue) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.as_str().to_string(),
            name: None,
            config,
            position: None,
            is_output: false,
        }
    }

    /// Sets the node's label.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Marks the node as an explicit workflow output.
    #[must_use]
    pub fn as_output(mut self) -> Self {
        self.is_output = true;
        self
    }

    /// Parses the declared type.
    ///
    /// # Errors
    ///
    /// Returns an error if the type string names no known node kind.
    pub fn kind(&self) -> Result<NodeType, UnknownNodeType> {
        self.node_type.parse()
    }

    /// Returns the label if set, otherwise the id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_canonical_and_alias_names() {
        assert_eq!("http-request".parse::<NodeType>(), Ok(NodeType::HttpRequest));
        assert_eq!("manual".parse::<NodeType>(), Ok(NodeType::ManualTrigger));
        assert_eq!("google-sheets".parse::<NodeType>(), Ok(NodeType::GoogleSheets));
        assert!("teleport".parse::<NodeType>().is_err());
    }

    #[test]
    fn every_type_round_trips_through_its_wire_name() {
        for node_type in NodeType::ALL {
            assert_eq!(node_type.as_str().parse::<NodeType>(), Ok(node_type));
        }
    }

    #[test]
    fn trigger_category() {
        assert!(NodeType::WebhookTrigger.is_trigger());
        assert!(!NodeType::HttpRequest.is_trigger());
        assert_eq!(NodeType::Comment.category(), NodeCategory::Annotation);
    }

    #[test]
    fn stored_node_keeps_unknown_type() {
        let raw = json!({ "id": "n1", "type": "mystery", "config": { "a": 1 } });
        let node: Node = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(node.node_type, "mystery");
        assert!(node.kind().is_err());
    }

    #[test]
    fn stored_node_defaults_missing_config() {
        let raw = json!({ "id": "n1", "type": "manual" });
        let node: Node = serde_json::from_value(raw).expect("deserialize");
        assert!(node.config.is_null());
        assert!(!node.is_output);
        assert_eq!(node.display_name(), "n1");
    }
}
