//! Built-in node executors.
//!
//! - `trigger`: manual, webhook and schedule entry points
//! - `logic`: if, switch, filter, loop, set, sort, code and merge
//! - `flow`: wait and sub-workflow, the two suspending node types
//! - `integration`: every node that calls an external service

mod flow;
mod integration;
mod logic;
mod trigger;

pub use flow::{SubWorkflowNode, WaitNode};
pub use integration::IntegrationNode;
pub use logic::{CodeNode, FilterNode, IfNode, LoopNode, MergeNode, SetNode, SortNode, SwitchNode};
pub use trigger::TriggerNode;

use crate::executor::{ExecutorRegistry, NodeContext};
use flowforge_workflow::expression::Sandbox;
use flowforge_workflow::{NodeError, NodeType};
use serde_json::Value as JsonValue;

impl ExecutorRegistry {
    /// A registry with an executor for every executable node type.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new()
            .with(NodeType::ManualTrigger, TriggerNode)
            .with(NodeType::WebhookTrigger, TriggerNode)
            .with(NodeType::ScheduleTrigger, TriggerNode)
            .with(NodeType::If, IfNode)
            .with(NodeType::Switch, SwitchNode)
            .with(NodeType::Filter, FilterNode)
            .with(NodeType::Loop, LoopNode)
            .with(NodeType::Set, SetNode)
            .with(NodeType::Sort, SortNode)
            .with(NodeType::Code, CodeNode)
            .with(NodeType::Merge, MergeNode)
            .with(NodeType::Wait, WaitNode)
            .with(NodeType::SubWorkflow, SubWorkflowNode);
        for node_type in NodeType::ALL {
            if node_type.category() == flowforge_workflow::NodeCategory::Integration {
                registry.register(node_type, IntegrationNode);
            }
        }
        registry
    }
}

/// The error for a config variant that does not belong to the executor.
fn wrong_config(ctx: &NodeContext) -> NodeError {
    ctx.config_invalid("config does not match the node type")
}

/// The collection a `filter`, `loop` or `sort` node works on.
///
/// `items` selects it with an expression; otherwise it is the merged input.
fn collection(
    ctx: &NodeContext,
    items: Option<&str>,
    sandbox: &Sandbox<'_>,
    json: &JsonValue,
) -> Result<Vec<JsonValue>, NodeError> {
    let value = match items.filter(|s| !s.trim().is_empty()) {
        Some(source) => sandbox.evaluate(source).map_err(|e| ctx.evaluation(&e))?,
        None => json.clone(),
    };
    match value {
        JsonValue::Array(items) => Ok(items),
        JsonValue::Null => Ok(Vec::new()),
        other => Err(ctx.config_invalid(format!(
            "expected an array of items, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::config::EngineConfig;
    use crate::executor::{NoDatabase, NodeContext, Services};
    use async_trait::async_trait;
    use flowforge_core::Result;
    use flowforge_integration::{
        Connector, ConnectorError, CredentialCipher, CredentialResolver, HttpRequest,
        HttpResponse, MemoryCredentialVault, ProviderEndpoints,
    };
    use serde_json::Value as JsonValue;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex, PoisonError};

    /// Records requests and answers every one with the same body.
    #[derive(Default)]
    pub struct RecordingConnector {
        pub requests: Mutex<Vec<HttpRequest>>,
        pub reply: JsonValue,
    }

    impl RecordingConnector {
        pub fn replying(reply: JsonValue) -> Self {
            Self {
                requests: Mutex::default(),
                reply,
            }
        }

        pub fn sent(&self) -> Vec<HttpRequest> {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl Connector for RecordingConnector {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ConnectorError> {
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request);
            Ok(HttpResponse {
                status: 200,
                headers: BTreeMap::new(),
                body: self.reply.clone(),
            })
        }
    }

    pub fn cipher() -> CredentialCipher {
        CredentialCipher::new(&[7u8; 32]).expect("key")
    }

    pub fn services_with(
        connector: Arc<dyn Connector>,
        credentials: Arc<CredentialResolver>,
    ) -> Arc<Services> {
        Arc::new(Services {
            credentials,
            connector,
            database: Arc::new(NoDatabase),
            endpoints: ProviderEndpoints::default(),
            config: EngineConfig::default(),
        })
    }

    pub fn resolver() -> Arc<CredentialResolver> {
        Arc::new(CredentialResolver::new(
            Arc::new(MemoryCredentialVault::new()),
            cipher(),
        ))
    }

    pub fn context(id: &str) -> NodeContext {
        let connector = Arc::new(RecordingConnector::replying(JsonValue::Null));
        NodeContext::detached(id, services_with(connector, resolver()))
    }
}
