//! Trigger lookup.
//!
//! Triggers are nodes in the workflow graph that serve as entry points.
//! The scheduler and the webhook endpoint need to find them without
//! planning the whole graph, so this module extracts them from a
//! workflow's stored nodes.

use crate::config::{NodeConfig, ScheduleTriggerConfig, WebhookTriggerConfig};
use crate::definition::Workflow;
use crate::execution::ExecutionMode;
use crate::node::{NodeId, NodeType};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The type of trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Webhook,
    Schedule,
}

impl TriggerType {
    /// The execution mode a run started by this trigger gets.
    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Self::Manual => ExecutionMode::Manual,
            Self::Webhook => ExecutionMode::Webhook,
            Self::Schedule => ExecutionMode::Schedule,
        }
    }
}

/// Trigger-specific configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerConfig {
    Manual,
    Webhook(WebhookTriggerConfig),
    Schedule(ScheduleTriggerConfig),
}

/// A trigger node found in a workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub node_id: NodeId,
    pub config: TriggerConfig,
}

impl Trigger {
    #[must_use]
    pub fn trigger_type(&self) -> TriggerType {
        match &self.config {
            TriggerConfig::Manual => TriggerType::Manual,
            TriggerConfig::Webhook(_) => TriggerType::Webhook,
            TriggerConfig::Schedule(_) => TriggerType::Schedule,
        }
    }

    /// The payload a scheduled run starts with.
    #[must_use]
    pub fn schedule_payload(&self) -> JsonValue {
        match &self.config {
            TriggerConfig::Schedule(config) => config
                .payload
                .clone()
                .unwrap_or_else(|| JsonValue::Object(serde_json::Map::new())),
            _ => JsonValue::Null,
        }
    }
}

/// Returns the trigger nodes of `workflow` in stored order.
///
/// Trigger nodes whose config does not parse are left out; planning reports
/// them when the workflow actually runs.
#[must_use]
pub fn triggers(workflow: &Workflow) -> Vec<Trigger> {
    workflow
        .nodes
        .iter()
        .filter_map(|node| {
            let kind = node.kind().ok().filter(NodeType::is_trigger)?;
            let config = match NodeConfig::parse(kind, &node.config).ok()? {
                NodeConfig::ManualTrigger(_) => TriggerConfig::Manual,
                NodeConfig::WebhookTrigger(c) => TriggerConfig::Webhook(c),
                NodeConfig::ScheduleTrigger(c) => TriggerConfig::Schedule(c),
                _ => return None,
            };
            Some(Trigger {
                node_id: node.id.clone(),
                config,
            })
        })
        .collect()
}

/// Returns the schedule triggers of `workflow`.
#[must_use]
pub fn schedule_triggers(workflow: &Workflow) -> Vec<Trigger> {
    triggers(workflow)
        .into_iter()
        .filter(|t| t.trigger_type() == TriggerType::Schedule)
        .collect()
}

/// Finds the webhook trigger whose `path` matches `path`.
///
/// Leading and trailing slashes are ignored on both sides.
#[must_use]
pub fn find_webhook(workflow: &Workflow, path: &str) -> Option<Trigger> {
    let wanted = normalize_path(path);
    triggers(workflow).into_iter().find(|t| match &t.config {
        TriggerConfig::Webhook(config) => normalize_path(&config.path) == wanted,
        _ => false,
    })
}

fn normalize_path(path: &str) -> &str {
    path.trim_matches('/')
}
