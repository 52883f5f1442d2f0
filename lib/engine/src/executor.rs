//! The executor contract and the registry that maps node types to executors.
//!
//! An executor is a mapping `(config, inputs, context) -> NodeOutput`.
//! Everything it may touch outside its arguments (credentials, the HTTP
//! connector, the database driver, child workflows) arrives through the
//! [`NodeContext`], so executors stay testable without a runner.

use crate::config::EngineConfig;
use crate::error::EngineError;
use async_trait::async_trait;
use flowforge_core::{ExecutionId, WorkflowId};
use flowforge_integration::{
    Connector, ConnectorError, CredentialError, CredentialProvider, ProviderEndpoints,
    ResolvedCredential,
};
use flowforge_workflow::expression::{EvalError, Sandbox, Scope};
use flowforge_workflow::{
    Execution, ExecutionMode, GraphError, NodeConfig, NodeError, NodeErrorKind, NodeId, NodeOutput,
    NodeType, Schedule, WorkflowGraph,
};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Executes nodes of one type.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Runs the node once.
    ///
    /// `inputs` is the ordered list of values that reached the node along
    /// its taken edges; entry nodes receive the trigger payload.
    ///
    /// # Errors
    ///
    /// Returns a [`NodeError`] whose `retryable` flag drives the runner's
    /// retry policy.
    async fn execute(
        &self,
        config: &NodeConfig,
        inputs: &[JsonValue],
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError>;

    /// Time budget for one invocation.
    fn timeout(&self, _config: &NodeConfig, limits: &EngineConfig) -> Duration {
        limits.node_timeout()
    }
}

/// SQL access for `database` nodes.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Runs `query` against the database at `url`, returning rows as JSON
    /// objects (or `{"rowsAffected": n}` for statements).
    ///
    /// # Errors
    ///
    /// Returns a connector error classified for retry.
    async fn query(
        &self,
        url: &str,
        query: &str,
        params: &[JsonValue],
    ) -> flowforge_core::Result<JsonValue, ConnectorError>;
}

/// Database client used when no driver is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDatabase;

#[async_trait]
impl DatabaseClient for NoDatabase {
    async fn query(
        &self,
        _url: &str,
        _query: &str,
        _params: &[JsonValue],
    ) -> flowforge_core::Result<JsonValue, ConnectorError> {
        Err(ConnectorError::InvalidParameters {
            operation: "database".to_string(),
            reason: "no database driver is configured".to_string(),
        }
        .into())
    }
}

/// A child execution requested by a `sub-workflow` node.
#[derive(Debug, Clone)]
pub struct ChildRun {
    pub workflow_id: WorkflowId,
    pub payload: JsonValue,
    pub mode: ExecutionMode,
    pub parent: ExecutionId,
    /// Nesting depth of the child.
    pub depth: u32,
    /// Block until the child is terminal.
    pub wait: bool,
    pub cancel: CancellationToken,
}

/// Starts child executions.
#[async_trait]
pub trait SubWorkflowLauncher: Send + Sync {
    /// Creates the child execution and either runs it to completion
    /// (`wait = true`) or starts it in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the child workflow does not exist or its record
    /// cannot be persisted.
    async fn launch(&self, child: ChildRun) -> flowforge_core::Result<Execution, EngineError>;
}

/// Collaborators shared by every node of every execution.
#[derive(Clone)]
pub struct Services {
    pub credentials: Arc<dyn CredentialProvider>,
    pub connector: Arc<dyn Connector>,
    pub database: Arc<dyn DatabaseClient>,
    pub endpoints: ProviderEndpoints,
    pub config: EngineConfig,
}

/// Signals from suspended nodes to the runner that owns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspension {
    Enter,
    Leave,
}

struct SuspensionGuard(mpsc::UnboundedSender<Suspension>);

impl Drop for SuspensionGuard {
    fn drop(&mut self) {
        let _ = self.0.send(Suspension::Leave);
    }
}

/// What a node can see while it runs.
#[derive(Clone)]
pub struct NodeContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub mode: ExecutionMode,
    pub node_id: NodeId,
    pub trigger: Arc<JsonValue>,
    /// Outputs of the nodes completed so far, for `$node.<id>`.
    pub nodes: Arc<HashMap<String, JsonValue>>,
    pub services: Arc<Services>,
    pub launcher: Option<Arc<dyn SubWorkflowLauncher>>,
    pub cancel: CancellationToken,
    pub depth: u32,
    suspensions: mpsc::UnboundedSender<Suspension>,
}

/// Everything a runner hands to [`NodeContext::new`].
pub struct RunScope {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub mode: ExecutionMode,
    pub trigger: Arc<JsonValue>,
    pub services: Arc<Services>,
    pub launcher: Option<Arc<dyn SubWorkflowLauncher>>,
    pub cancel: CancellationToken,
    pub depth: u32,
    pub suspensions: mpsc::UnboundedSender<Suspension>,
}

impl NodeContext {
    #[must_use]
    pub fn new(run: &RunScope, node_id: NodeId, nodes: Arc<HashMap<String, JsonValue>>) -> Self {
        Self {
            execution_id: run.execution_id,
            workflow_id: run.workflow_id,
            mode: run.mode,
            node_id,
            trigger: Arc::clone(&run.trigger),
            nodes,
            services: Arc::clone(&run.services),
            launcher: run.launcher.clone(),
            cancel: run.cancel.clone(),
            depth: run.depth,
            suspensions: run.suspensions.clone(),
        }
    }

    /// A context outside any runner; suspensions go nowhere.
    #[must_use]
    pub fn detached(node_id: impl Into<NodeId>, services: Arc<Services>) -> Self {
        let (suspensions, _) = mpsc::unbounded_channel();
        Self {
            execution_id: ExecutionId::new(),
            workflow_id: WorkflowId::new(),
            mode: ExecutionMode::Manual,
            node_id: node_id.into(),
            trigger: Arc::new(JsonValue::Null),
            nodes: Arc::new(HashMap::new()),
            services,
            launcher: None,
            cancel: CancellationToken::new(),
            depth: 0,
            suspensions,
        }
    }

    /// The expression scope for one invocation.
    #[must_use]
    pub fn scope<'a>(&'a self, json: &'a JsonValue, inputs: &'a [JsonValue]) -> Scope<'a> {
        Scope::new(json)
            .with_inputs(inputs)
            .with_trigger(&self.trigger)
            .with_nodes(&self.nodes)
    }

    /// A script sandbox over [`Self::scope`], limited by the engine config.
    #[must_use]
    pub fn sandbox<'a>(&'a self, json: &'a JsonValue, inputs: &'a [JsonValue]) -> Sandbox<'a> {
        Sandbox::new(self.scope(json, inputs), self.services.config.script_limits())
    }

    /// Resolves an optional credential reference.
    ///
    /// # Errors
    ///
    /// Unknown or undecryptable credentials are non-retryable; a failing
    /// vault backend is retryable.
    pub async fn credential(&self, id: Option<&str>) -> Result<Option<ResolvedCredential>, NodeError> {
        let Some(id) = id else {
            return Ok(None);
        };
        self.services
            .credentials
            .resolve(id)
            .await
            .map(Some)
            .map_err(|report| self.credential_error(report.current_context()))
    }

    /// Runs `work` with the execution marked WAITING.
    pub async fn suspended<F: Future>(&self, work: F) -> F::Output {
        let _ = self.suspensions.send(Suspension::Enter);
        let _guard = SuspensionGuard(self.suspensions.clone());
        work.await
    }

    #[must_use]
    pub fn config_invalid(&self, message: impl Into<String>) -> NodeError {
        NodeError::config_invalid(self.node_id.clone(), message)
    }

    #[must_use]
    pub fn evaluation(&self, error: &EvalError) -> NodeError {
        NodeError::evaluation(self.node_id.clone(), error.to_string())
    }

    /// Maps a connector failure, keeping its retry classification.
    #[must_use]
    pub fn connector_error(&self, error: &ConnectorError) -> NodeError {
        let node_id = self.node_id.clone();
        match error {
            ConnectorError::RateLimited { .. } => NodeError::rate_limited(node_id, error.to_string()),
            ConnectorError::Timeout => NodeError::new(node_id, NodeErrorKind::Timeout, error.to_string()),
            ConnectorError::InvalidParameters { .. } => {
                NodeError::config_invalid(node_id, error.to_string())
            }
            ConnectorError::AuthenticationFailed { .. }
            | ConnectorError::ConnectionFailed { .. }
            | ConnectorError::UpstreamStatus { .. }
            | ConnectorError::ProtocolError { .. } => {
                NodeError::upstream(node_id, error.to_string(), error.is_retryable())
            }
        }
    }

    fn credential_error(&self, error: &CredentialError) -> NodeError {
        match error {
            CredentialError::StorageFailed { .. } => {
                NodeError::upstream(self.node_id.clone(), error.to_string(), true)
            }
            _ => NodeError::credential_not_found(self.node_id.clone(), error.to_string()),
        }
    }
}

/// Maps node types to executors.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<NodeType, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the executor for `node_type`.
    pub fn register(&mut self, node_type: NodeType, executor: impl NodeExecutor + 'static) {
        self.executors.insert(node_type, Arc::new(executor));
    }

    /// Builder form of [`ExecutorRegistry::register`].
    #[must_use]
    pub fn with(mut self, node_type: NodeType, executor: impl NodeExecutor + 'static) -> Self {
        self.register(node_type, executor);
        self
    }

    #[must_use]
    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(&node_type).cloned()
    }

    /// Fails if a scheduled node has no executor.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnsupportedNodeType`] for the first such node in
    /// schedule order.
    pub fn check(&self, graph: &WorkflowGraph, schedule: &Schedule) -> Result<(), GraphError> {
        for id in schedule.ordered() {
            let Some(node) = graph.node(id) else {
                continue;
            };
            if !self.executors.contains_key(&node.node_type) {
                return Err(GraphError::UnsupportedNodeType {
                    node_id: node.id.clone(),
                    node_type: node.node_type.to_string(),
                });
            }
        }
        Ok(())
    }
}
