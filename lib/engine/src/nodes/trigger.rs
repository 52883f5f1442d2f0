use crate::executor::{NodeContext, NodeExecutor};
use async_trait::async_trait;
use flowforge_workflow::expression::merge_inputs;
use flowforge_workflow::{NodeConfig, NodeError, NodeOutput};
use serde_json::Value as JsonValue;

/// Entry node; emits the trigger payload unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerNode;

#[async_trait]
impl NodeExecutor for TriggerNode {
    async fn execute(
        &self,
        _config: &NodeConfig,
        inputs: &[JsonValue],
        _ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::value(merge_inputs(inputs)))
    }
}
