//! Nodes that suspend the run while they wait on time or on another run.

use super::wrong_config;
use crate::config::EngineConfig;
use crate::executor::{ChildRun, NodeContext, NodeExecutor};
use async_trait::async_trait;
use flowforge_core::WorkflowId;
use flowforge_workflow::config::WaitMode;
use flowforge_workflow::expression::merge_inputs;
use flowforge_workflow::{ExecutionStatus, NodeConfig, NodeError, NodeOutput};
use serde_json::{Value as JsonValue, json};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Pauses the run, then passes its input through.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitNode;

fn wait_duration(seconds: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(seconds).ok()
}

#[async_trait]
impl NodeExecutor for WaitNode {
    async fn execute(
        &self,
        config: &NodeConfig,
        inputs: &[JsonValue],
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Wait(config) = config else {
            return Err(wrong_config(ctx));
        };
        let max = ctx.services.config.max_wait();
        let duration = wait_duration(config.duration)
            .filter(|d| *d <= max)
            .ok_or_else(|| {
                ctx.config_invalid(format!(
                    "wait of {}s exceeds the {}s limit",
                    config.duration,
                    max.as_secs()
                ))
            })?;

        debug!(node_id = %ctx.node_id, ?duration, "waiting");
        ctx.suspended(async {
            tokio::select! {
                () = tokio::time::sleep(duration) => {}
                () = ctx.cancel.cancelled() => {}
            }
        })
        .await;
        Ok(NodeOutput::value(merge_inputs(inputs)))
    }

    fn timeout(&self, config: &NodeConfig, limits: &EngineConfig) -> Duration {
        let default = limits.node_timeout();
        match config {
            NodeConfig::Wait(config) => {
                wait_duration(config.duration).map_or(default, |d| d + default)
            }
            _ => default,
        }
    }
}

/// Runs another workflow, either inline or in the background.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubWorkflowNode;

#[async_trait]
impl NodeExecutor for SubWorkflowNode {
    async fn execute(
        &self,
        config: &NodeConfig,
        inputs: &[JsonValue],
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let NodeConfig::SubWorkflow(config) = config else {
            return Err(wrong_config(ctx));
        };
        let workflow_id: WorkflowId = config
            .workflow_id
            .parse()
            .map_err(|e| ctx.config_invalid(format!("workflowId: {e}")))?;
        let Some(launcher) = &ctx.launcher else {
            return Err(ctx.config_invalid("sub-workflows cannot run outside the engine"));
        };
        let depth = ctx.depth + 1;
        let max_depth = ctx.services.config.sub_workflow_max_depth;
        if depth > max_depth {
            return Err(ctx.config_invalid(format!(
                "sub-workflow nesting is limited to {max_depth} levels"
            )));
        }

        let json = merge_inputs(inputs);
        let payload = match &config.input {
            Some(input) => ctx
                .sandbox(&json, inputs)
                .resolve_value(input)
                .map_err(|e| ctx.evaluation(&e))?,
            None => json.clone(),
        };
        let wait = config.wait_mode == WaitMode::Sync;
        let child = ChildRun {
            workflow_id,
            payload,
            mode: ctx.mode,
            parent: ctx.execution_id,
            depth,
            wait,
            cancel: if wait {
                ctx.cancel.child_token()
            } else {
                CancellationToken::new()
            },
        };

        let launched = if wait {
            ctx.suspended(launcher.launch(child)).await
        } else {
            launcher.launch(child).await
        };
        let execution = launched.map_err(|report| {
            NodeError::upstream(ctx.node_id.clone(), report.current_context().to_string(), false)
        })?;
        info!(
            node_id = %ctx.node_id,
            child_execution_id = %execution.id,
            status = %execution.status,
            "sub-workflow launched"
        );

        if !wait {
            return Ok(NodeOutput::value(json!({
                "executionId": execution.id.to_string(),
                "status": execution.status.as_str(),
            })));
        }
        match execution.status {
            ExecutionStatus::Success => Ok(NodeOutput::value(
                execution.output_data.unwrap_or(JsonValue::Null),
            )),
            status => {
                let reason = execution
                    .error
                    .map_or_else(|| status.to_string(), |failure| failure.to_string());
                Err(NodeError::upstream(
                    ctx.node_id.clone(),
                    format!("sub-workflow execution {} ended {status}: {reason}", execution.id),
                    false,
                ))
            }
        }
    }

    /// A synchronous call spans the whole child run, so it gets the
    /// sub-workflow budget instead of the per-node one.
    fn timeout(&self, config: &NodeConfig, limits: &EngineConfig) -> Duration {
        match config {
            NodeConfig::SubWorkflow(config) if config.wait_mode == WaitMode::Sync => {
                limits.sub_workflow_timeout()
            }
            _ => limits.node_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::executor::SubWorkflowLauncher;
    use crate::nodes::testing::context;
    use flowforge_workflow::{Execution, ExecutionFailure, ExecutionMode, NodeErrorKind, NodeType};
    use std::sync::{Arc, Mutex, PoisonError};

    struct FixedLauncher {
        outcome: ExecutionStatus,
        calls: Mutex<Vec<ChildRun>>,
    }

    impl FixedLauncher {
        fn new(outcome: ExecutionStatus) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                calls: Mutex::default(),
            })
        }
    }

    #[async_trait]
    impl SubWorkflowLauncher for FixedLauncher {
        async fn launch(&self, child: ChildRun) -> flowforge_core::Result<Execution, EngineError> {
            let mut execution =
                Execution::new(child.workflow_id, 1, ExecutionMode::Manual, child.payload.clone());
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(child);
            match self.outcome {
                ExecutionStatus::Success => {
                    execution.start().expect("start");
                    execution.succeed(json!({ "child": "done" })).expect("succeed");
                }
                ExecutionStatus::Error => {
                    execution
                        .fail(ExecutionFailure::planning("boom"))
                        .expect("fail");
                }
                _ => {}
            }
            Ok(execution)
        }
    }

    fn sub_config(id: WorkflowId, mode: &str) -> NodeConfig {
        NodeConfig::parse(
            NodeType::SubWorkflow,
            &json!({ "workflowId": id.to_string(), "waitMode": mode }),
        )
        .expect("valid")
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_then_passes_through() {
        let config = NodeConfig::parse(NodeType::Wait, &json!({ "duration": 5 })).expect("valid");
        let started = tokio::time::Instant::now();
        let output = WaitNode
            .execute(&config, &[json!({ "k": 1 })], &context("w"))
            .await
            .expect("execute");
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(output.to_json(), json!({ "k": 1 }));
        assert_eq!(
            WaitNode.timeout(&config, &EngineConfig::default()),
            Duration::from_secs(35)
        );
    }

    #[tokio::test]
    async fn wait_beyond_limit_is_config_error() {
        let config =
            NodeConfig::parse(NodeType::Wait, &json!({ "duration": 1_000_000 })).expect("valid");
        let err = WaitNode.execute(&config, &[], &context("w")).await.unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::ConfigInvalid);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_early_on_cancel() {
        let config = NodeConfig::parse(NodeType::Wait, &json!({ "duration": 600 })).expect("valid");
        let ctx = context("w");
        ctx.cancel.cancel();
        let started = tokio::time::Instant::now();
        WaitNode.execute(&config, &[], &ctx).await.expect("execute");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn sync_sub_workflow_returns_child_output() {
        let launcher = FixedLauncher::new(ExecutionStatus::Success);
        let mut ctx = context("sub");
        ctx.launcher = Some(launcher.clone());
        let child_id = WorkflowId::new();

        let output = SubWorkflowNode
            .execute(&sub_config(child_id, "sync"), &[json!({ "x": 1 })], &ctx)
            .await
            .expect("execute");
        assert_eq!(output.to_json(), json!({ "child": "done" }));

        let calls = launcher.calls.lock().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].workflow_id, child_id);
        assert_eq!(calls[0].payload, json!({ "x": 1 }));
        assert_eq!(calls[0].depth, 1);
        assert!(calls[0].wait);
    }

    #[tokio::test]
    async fn failed_child_is_not_retried() {
        let mut ctx = context("sub");
        ctx.launcher = Some(FixedLauncher::new(ExecutionStatus::Error));
        let err = SubWorkflowNode
            .execute(&sub_config(WorkflowId::new(), "sync"), &[], &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::UpstreamServiceError);
        assert!(!err.retryable);
        assert!(err.message.contains("boom"), "{}", err.message);
    }

    #[tokio::test]
    async fn async_sub_workflow_returns_reference() {
        let mut ctx = context("sub");
        ctx.launcher = Some(FixedLauncher::new(ExecutionStatus::Pending));
        let output = SubWorkflowNode
            .execute(&sub_config(WorkflowId::new(), "async"), &[], &ctx)
            .await
            .expect("execute");
        let json = output.to_json();
        assert_eq!(json["status"], json!("PENDING"));
        assert!(json["executionId"].as_str().is_some_and(|id| id.starts_with("exec_")));
    }

    #[tokio::test]
    async fn nesting_is_bounded() {
        let mut ctx = context("sub");
        ctx.launcher = Some(FixedLauncher::new(ExecutionStatus::Success));
        ctx.depth = ctx.services.config.sub_workflow_max_depth;
        let err = SubWorkflowNode
            .execute(&sub_config(WorkflowId::new(), "sync"), &[], &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::ConfigInvalid);
    }

    #[test]
    fn sync_sub_workflow_is_bounded_by_its_own_timeout() {
        let limits = EngineConfig {
            node_timeout_secs: 5,
            sub_workflow_timeout_secs: 120,
            ..EngineConfig::default()
        };
        assert_eq!(
            SubWorkflowNode.timeout(&sub_config(WorkflowId::new(), "sync"), &limits),
            Duration::from_secs(120)
        );
        assert_eq!(
            SubWorkflowNode.timeout(&sub_config(WorkflowId::new(), "async"), &limits),
            Duration::from_secs(5)
        );
    }
}
