//! The engine facade used by the API, the scheduler and `sub-workflow` nodes.
//!
//! `Engine` owns the stores and the shared services, creates execution
//! records, hands them to a runner and keeps a cancellation token for every
//! execution it is currently running.

use crate::alert::{AlertSink, WebhookAlertSink};
use crate::config::EngineConfig;
use crate::error::{EngineError, StoreError};
use crate::executor::{
    ChildRun, DatabaseClient, ExecutorRegistry, NoDatabase, Services, SubWorkflowLauncher,
};
use crate::runner::{Runner, stored};
use crate::store::{ExecutionStore, WorkflowStore};
use async_trait::async_trait;
use flowforge_core::{ExecutionId, Result, UserId, WorkflowId};
use flowforge_integration::{
    Connector, CredentialProvider, HttpConnector, ProviderEndpoints, RateLimiter,
};
use flowforge_workflow::trigger::find_webhook;
use flowforge_workflow::{
    Edge, ErrorAlertConfig, Execution, ExecutionMode, ExecutionSummary, Node, NodeId,
    VersionError, Workflow, WorkflowVersion,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Attempts at writing a cancellation before giving up on a busy record.
const CANCEL_ATTEMPTS: usize = 5;

/// A request to run a workflow.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub workflow_id: WorkflowId,
    pub payload: JsonValue,
    pub mode: ExecutionMode,
    pub triggered_by: Option<UserId>,
    /// Start only from this trigger node.
    pub fired_trigger: Option<NodeId>,
}

impl ExecutionRequest {
    #[must_use]
    pub fn manual(workflow_id: WorkflowId, payload: JsonValue) -> Self {
        Self {
            workflow_id,
            payload,
            mode: ExecutionMode::Manual,
            triggered_by: None,
            fired_trigger: None,
        }
    }

    #[must_use]
    pub fn by(mut self, user: UserId) -> Self {
        self.triggered_by = Some(user);
        self
    }

    #[must_use]
    pub fn fired(mut self, mode: ExecutionMode, trigger: NodeId) -> Self {
        self.mode = mode;
        self.fired_trigger = Some(trigger);
        self
    }
}

/// The body of a workflow save. Absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDraft {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub nodes: Option<Vec<Node>>,
    #[serde(default)]
    pub edges: Option<Vec<Edge>>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub error_alerts: Option<ErrorAlertConfig>,
}

impl WorkflowDraft {
    /// A draft that replaces the graph.
    #[must_use]
    pub fn graph(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self {
            nodes: Some(nodes),
            edges: Some(edges),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn active(mut self, active: bool) -> Self {
        self.is_active = Some(active);
        self
    }

    #[must_use]
    pub fn alerts(mut self, alerts: ErrorAlertConfig) -> Self {
        self.error_alerts = Some(alerts);
        self
    }

    fn touches_graph(&self) -> bool {
        self.nodes.is_some() || self.edges.is_some()
    }

    fn apply_metadata(&self, workflow: &mut Workflow) {
        if let Some(name) = &self.name {
            workflow.name.clone_from(name);
        }
        if let Some(description) = &self.description {
            workflow.description = Some(description.clone());
        }
        match self.is_active {
            Some(true) => workflow.activate(),
            Some(false) => workflow.deactivate(),
            None => {}
        }
        if let Some(alerts) = &self.error_alerts {
            workflow.error_alerts = alerts.clone();
        }
        workflow.touch();
    }
}

/// Assembles an [`Engine`].
pub struct EngineBuilder {
    workflows: Arc<dyn WorkflowStore>,
    executions: Arc<dyn ExecutionStore>,
    credentials: Arc<dyn CredentialProvider>,
    connector: Option<Arc<dyn Connector>>,
    database: Option<Arc<dyn DatabaseClient>>,
    alerts: Option<Arc<dyn AlertSink>>,
    registry: Option<ExecutorRegistry>,
    endpoints: ProviderEndpoints,
    config: EngineConfig,
}

impl EngineBuilder {
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    #[must_use]
    pub fn database(mut self, database: Arc<dyn DatabaseClient>) -> Self {
        self.database = Some(database);
        self
    }

    #[must_use]
    pub fn alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Replaces the built-in executors.
    #[must_use]
    pub fn registry(mut self, registry: ExecutorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn endpoints(mut self, endpoints: ProviderEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the engine, creating the default HTTP clients where none were
    /// given.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Setup`] if an HTTP client cannot be built.
    pub fn build(self) -> Result<Engine, EngineError> {
        let setup = |reason: String| EngineError::Setup { reason };
        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(
                HttpConnector::new(self.config.node_timeout(), RateLimiter::default())
                    .map_err(|report| setup(report.current_context().to_string()))?,
            ),
        };
        let alerts: Arc<dyn AlertSink> = match self.alerts {
            Some(alerts) => alerts,
            None => Arc::new(
                WebhookAlertSink::new(self.config.node_timeout())
                    .map_err(|report| setup(report.current_context().to_string()))?,
            ),
        };
        let services = Services {
            credentials: self.credentials,
            connector,
            database: self.database.unwrap_or_else(|| Arc::new(NoDatabase)),
            endpoints: self.endpoints,
            config: self.config,
        };
        Ok(Engine {
            inner: Arc::new(EngineInner {
                workflows: self.workflows,
                executions: self.executions,
                registry: Arc::new(self.registry.unwrap_or_else(ExecutorRegistry::builtin)),
                services: Arc::new(services),
                alerts,
                active: Mutex::default(),
            }),
        })
    }
}

struct EngineInner {
    workflows: Arc<dyn WorkflowStore>,
    executions: Arc<dyn ExecutionStore>,
    registry: Arc<ExecutorRegistry>,
    services: Arc<Services>,
    alerts: Arc<dyn AlertSink>,
    /// Executions running in this process.
    active: Mutex<HashMap<ExecutionId, CancellationToken>>,
}

/// Runs workflows and manages their definitions and execution records.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Drops the active-token entry when a run ends, however it ends.
struct ActiveRun<'a> {
    engine: &'a Engine,
    id: ExecutionId,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.engine.active().remove(&self.id);
    }
}

impl Engine {
    #[must_use]
    pub fn builder(
        workflows: Arc<dyn WorkflowStore>,
        executions: Arc<dyn ExecutionStore>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> EngineBuilder {
        EngineBuilder {
            workflows,
            executions,
            credentials,
            connector: None,
            database: None,
            alerts: None,
            registry: None,
            endpoints: ProviderEndpoints::default(),
            config: EngineConfig::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.services.config
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<ExecutionId, CancellationToken>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn runner(&self) -> Runner {
        Runner {
            executions: Arc::clone(&self.inner.executions),
            workflows: Arc::clone(&self.inner.workflows),
            registry: Arc::clone(&self.inner.registry),
            services: Arc::clone(&self.inner.services),
            alerts: Arc::clone(&self.inner.alerts),
            launcher: Some(Arc::new(self.clone())),
        }
    }

    async fn load_workflow(&self, id: WorkflowId) -> Result<Workflow, EngineError> {
        match self.inner.workflows.get(id).await {
            Ok(workflow) => Ok(workflow),
            Err(report) if matches!(report.current_context(), StoreError::NotFound { .. }) => {
                Err(EngineError::WorkflowNotFound { workflow_id: id }.into())
            }
            Err(report) => Err(EngineError::from(report.current_context()).into()),
        }
    }

    async fn load_execution(&self, id: ExecutionId) -> Result<Execution, EngineError> {
        match self.inner.executions.get(id).await {
            Ok(execution) => Ok(execution),
            Err(report) if matches!(report.current_context(), StoreError::NotFound { .. }) => {
                Err(EngineError::ExecutionNotFound { execution_id: id }.into())
            }
            Err(report) => Err(EngineError::from(report.current_context()).into()),
        }
    }

    /// Records a PENDING execution against the workflow's current version.
    async fn create_execution(&self, request: ExecutionRequest) -> Result<Execution, EngineError> {
        let workflow = self.load_workflow(request.workflow_id).await?;
        let mut execution = Execution::new(
            workflow.id,
            workflow.version,
            request.mode,
            request.payload,
        );
        if let Some(user) = request.triggered_by {
            execution = execution.triggered_by(user);
        }
        if let Some(trigger) = request.fired_trigger {
            execution = execution.with_fired_trigger(trigger);
        }
        stored(self.inner.executions.insert(&execution).await)?;
        debug!(
            execution_id = %execution.id,
            workflow_id = %workflow.id,
            version = workflow.version,
            mode = %execution.mode,
            "execution created"
        );
        Ok(execution)
    }

    /// Runs a PENDING execution on the current task.
    async fn run(
        &self,
        id: ExecutionId,
        cancel: CancellationToken,
        depth: u32,
    ) -> Result<Execution, EngineError> {
        self.active().insert(id, cancel.clone());
        let _active = ActiveRun { engine: self, id };
        self.runner().run(id, cancel, depth).await
    }

    /// Runs a PENDING execution on a background task.
    fn spawn(&self, id: ExecutionId, cancel: CancellationToken, depth: u32) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(report) = engine.run(id, cancel, depth).await {
                error!(execution_id = %id, error = %report.current_context(), "execution runner failed");
            }
        });
    }

    /// Creates an execution and starts it in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the workflow does not exist or the execution
    /// record cannot be written. Failures of the run itself end up on the
    /// execution record.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id, mode = %request.mode))]
    pub async fn execute_workflow(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionId, EngineError> {
        let execution = self.create_execution(request).await?;
        self.spawn(execution.id, CancellationToken::new(), 0);
        info!(execution_id = %execution.id, "execution queued");
        Ok(execution.id)
    }

    /// Creates an execution and runs it on the current task.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::execute_workflow`], plus failures to persist the
    /// run's progress.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id, mode = %request.mode))]
    pub async fn run_to_completion(
        &self,
        request: ExecutionRequest,
    ) -> Result<Execution, EngineError> {
        let execution = self.create_execution(request).await?;
        self.run(execution.id, CancellationToken::new(), 0).await
    }

    /// Returns the execution with its node runs.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ExecutionNotFound`] for an unknown id.
    pub async fn get_execution(&self, id: ExecutionId) -> Result<Execution, EngineError> {
        self.load_execution(id).await
    }

    /// Lists a workflow's executions, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn list_executions(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<Vec<ExecutionSummary>, EngineError> {
        let executions = stored(self.inner.executions.list_for_workflow(workflow_id).await)?;
        Ok(executions.iter().map(ExecutionSummary::from).collect())
    }

    /// Starts a new execution with the input of a failed or cancelled one.
    ///
    /// The original record is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidTransition`] unless the original ended
    /// in ERROR or CANCELLED.
    #[instrument(skip(self))]
    pub async fn retry_execution(
        &self,
        id: ExecutionId,
        triggered_by: Option<UserId>,
    ) -> Result<ExecutionId, EngineError> {
        let original = self.load_execution(id).await?;
        let retry = original.new_retry(triggered_by).map_err(EngineError::from)?;
        stored(self.inner.executions.insert(&retry).await)?;
        self.spawn(retry.id, CancellationToken::new(), 0);
        info!(retry_id = %retry.id, retry_count = retry.retry_count, "retry queued");
        Ok(retry.id)
    }

    /// Cancels a non-terminal execution.
    ///
    /// The CANCELLED status is written first; the runner notices on its next
    /// write and stops. Nodes in flight have their results discarded.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidTransition`] if the execution already
    /// finished, or [`EngineError::Conflict`] if its record kept changing.
    #[instrument(skip(self))]
    pub async fn cancel_execution(&self, id: ExecutionId) -> Result<Execution, EngineError> {
        for _ in 0..CANCEL_ATTEMPTS {
            let mut execution = self.load_execution(id).await?;
            let seen = execution.status;
            execution.cancel().map_err(EngineError::from)?;
            if stored(self.inner.executions.update_if(seen, &execution).await)? {
                if let Some(token) = self.active().get(&id) {
                    token.cancel();
                }
                info!(previous = %seen, "execution cancelled");
                return Ok(execution);
            }
            debug!(previous = %seen, "execution moved on, re-reading");
        }
        Err(EngineError::Conflict {
            reason: format!("execution {id} kept changing while being cancelled"),
        }
        .into())
    }

    /// Deletes a finished execution.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ExecutionActive`] for an execution that has not
    /// reached a terminal state.
    pub async fn delete_execution(&self, id: ExecutionId) -> Result<(), EngineError> {
        let execution = self.load_execution(id).await?;
        if !execution.status.is_terminal() {
            return Err(EngineError::ExecutionActive {
                execution_id: id,
                status: execution.status,
            }
            .into());
        }
        stored(self.inner.executions.delete(id).await)
    }

    /// Creates the workflow, or updates it.
    ///
    /// Replacing the graph of an existing workflow snapshots the previous
    /// graph and bumps the version; other fields are updated in place.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Conflict`] if another save won the race.
    #[instrument(skip(self, draft))]
    pub async fn save_workflow(
        &self,
        id: WorkflowId,
        draft: WorkflowDraft,
        author: Option<UserId>,
    ) -> Result<Workflow, EngineError> {
        let mut workflow = match self.load_workflow(id).await {
            Ok(workflow) => workflow,
            Err(report) if matches!(report.current_context(), EngineError::WorkflowNotFound { .. }) => {
                let name = draft.name.clone().unwrap_or_else(|| "Untitled workflow".into());
                let mut workflow = Workflow::new(author.unwrap_or_default(), name).with_graph(
                    draft.nodes.clone().unwrap_or_default(),
                    draft.edges.clone().unwrap_or_default(),
                );
                workflow.id = id;
                draft.apply_metadata(&mut workflow);
                stored(self.inner.workflows.create(&workflow).await)?;
                info!(version = workflow.version, "workflow created");
                return Ok(workflow);
            }
            Err(report) => return Err(report),
        };

        draft.apply_metadata(&mut workflow);
        if !draft.touches_graph() {
            stored(self.inner.workflows.update_metadata(&workflow).await)?;
            debug!("workflow metadata updated");
            return Ok(workflow);
        }
        let nodes = draft.nodes.unwrap_or_else(|| workflow.nodes.clone());
        let edges = draft.edges.unwrap_or_else(|| workflow.edges.clone());
        let snapshot = workflow.save_graph(nodes, edges, author);
        stored(self.inner.workflows.update(&workflow, &snapshot).await)?;
        info!(
            version = workflow.version,
            snapshot = snapshot.version_num,
            "workflow graph saved"
        );
        Ok(workflow)
    }

    /// # Errors
    ///
    /// Returns [`EngineError::WorkflowNotFound`] for an unknown id.
    pub async fn get_workflow(&self, id: WorkflowId) -> Result<Workflow, EngineError> {
        self.load_workflow(id).await
    }

    /// Active workflows, for trigger registration.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn active_workflows(&self) -> Result<Vec<Workflow>, EngineError> {
        stored(self.inner.workflows.list_active().await)
    }

    /// Snapshots of earlier graphs, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::WorkflowNotFound`] for an unknown id.
    pub async fn list_versions(&self, id: WorkflowId) -> Result<Vec<WorkflowVersion>, EngineError> {
        self.load_workflow(id).await?;
        stored(self.inner.workflows.versions(id).await)
    }

    /// Restores the graph of an earlier version as a new version.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Version`] if no snapshot has that number.
    #[instrument(skip(self))]
    pub async fn rollback_workflow(
        &self,
        id: WorkflowId,
        version_num: u32,
        author: Option<UserId>,
    ) -> Result<Workflow, EngineError> {
        let mut workflow = self.load_workflow(id).await?;
        let Some(target) = stored(self.inner.workflows.version(id, version_num).await)? else {
            return Err(EngineError::from(VersionError::VersionNotFound {
                workflow_id: id,
                version_num,
            })
            .into());
        };
        let snapshot = workflow.rollback(&target, author).map_err(EngineError::from)?;
        stored(self.inner.workflows.update(&workflow, &snapshot).await)?;
        info!(restored = version_num, version = workflow.version, "workflow rolled back");
        Ok(workflow)
    }

    /// Starts the workflow from the webhook trigger registered at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::WorkflowInactive`] for inactive workflows and
    /// [`EngineError::WebhookNotFound`] when no trigger matches.
    #[instrument(skip(self, payload))]
    pub async fn webhook(
        &self,
        workflow_id: WorkflowId,
        path: &str,
        payload: JsonValue,
    ) -> Result<ExecutionId, EngineError> {
        let workflow = self.load_workflow(workflow_id).await?;
        if !workflow.is_active {
            return Err(EngineError::WorkflowInactive { workflow_id }.into());
        }
        let Some(trigger) = find_webhook(&workflow, path) else {
            return Err(EngineError::WebhookNotFound {
                workflow_id,
                path: path.to_string(),
            }
            .into());
        };
        let request = ExecutionRequest::manual(workflow_id, payload)
            .fired(ExecutionMode::Webhook, trigger.node_id);
        self.execute_workflow(request).await
    }

    /// Signals every execution running in this process to stop.
    pub fn shutdown(&self) {
        let active = self.active();
        if !active.is_empty() {
            warn!(running = active.len(), "cancelling running executions");
        }
        for token in active.values() {
            token.cancel();
        }
    }
}

#[async_trait]
impl SubWorkflowLauncher for Engine {
    async fn launch(&self, child: ChildRun) -> Result<Execution, EngineError> {
        let request = ExecutionRequest {
            workflow_id: child.workflow_id,
            payload: child.payload,
            mode: child.mode,
            triggered_by: None,
            fired_trigger: None,
        };
        let execution = self.create_execution(request).await?;
        info!(
            parent_execution_id = %child.parent,
            execution_id = %execution.id,
            depth = child.depth,
            wait = child.wait,
            "sub-workflow execution created"
        );
        if child.wait {
            self.run(execution.id, child.cancel, child.depth).await
        } else {
            self.spawn(execution.id, child.cancel, child.depth);
            Ok(execution)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::ErrorAlert;
    use crate::executor::{NodeContext, NodeExecutor};
    use crate::nodes::testing::{RecordingConnector, resolver};
    use crate::store::{MemoryExecutionStore, MemoryWorkflowStore};
    use flowforge_integration::ConnectorError;
    use flowforge_workflow::{
        ExecutionStatus, NodeConfig, NodeError, NodeErrorKind, NodeOutput, NodeRunStatus, NodeType,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Counts calls and emits the code expression's literal result.
    #[derive(Clone, Default)]
    struct Counting {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl NodeExecutor for Counting {
        async fn execute(
            &self,
            config: &NodeConfig,
            inputs: &[JsonValue],
            ctx: &NodeContext,
        ) -> std::result::Result<NodeOutput, NodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            crate::nodes::CodeNode.execute(config, inputs, ctx).await
        }
    }

    /// Fails a fixed number of times, then succeeds.
    struct Flaky {
        failures: AtomicU32,
        retryable: bool,
    }

    #[async_trait]
    impl NodeExecutor for Flaky {
        async fn execute(
            &self,
            _config: &NodeConfig,
            _inputs: &[JsonValue],
            ctx: &NodeContext,
        ) -> std::result::Result<NodeOutput, NodeError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left == 0 {
                return Ok(NodeOutput::value(json!("recovered")));
            }
            self.failures.store(left - 1, Ordering::SeqCst);
            Err(NodeError::upstream(ctx.node_id.clone(), "503 from upstream", self.retryable))
        }
    }

    struct Stalling;

    #[async_trait]
    impl NodeExecutor for Stalling {
        async fn execute(
            &self,
            _config: &NodeConfig,
            _inputs: &[JsonValue],
            _ctx: &NodeContext,
        ) -> std::result::Result<NodeOutput, NodeError> {
            std::future::pending().await
        }
    }

    #[derive(Default)]
    struct RecordingAlerts {
        sent: Mutex<Vec<(String, ErrorAlert)>>,
    }

    #[async_trait]
    impl AlertSink for RecordingAlerts {
        async fn deliver(&self, target: &str, alert: &ErrorAlert) -> Result<(), ConnectorError> {
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((target.to_string(), alert.clone()));
            Ok(())
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            node_timeout_secs: 1,
            ..EngineConfig::default()
        }
    }

    fn engine_with(registry: ExecutorRegistry) -> (Engine, Arc<RecordingAlerts>) {
        let alerts = Arc::new(RecordingAlerts::default());
        let engine = Engine::builder(
            Arc::new(MemoryWorkflowStore::new()),
            Arc::new(MemoryExecutionStore::new()),
            resolver(),
        )
        .connector(Arc::new(RecordingConnector::replying(json!({}))))
        .alerts(alerts.clone())
        .registry(registry)
        .config(test_config())
        .build()
        .expect("engine");
        (engine, alerts)
    }

    fn engine() -> Engine {
        engine_with(ExecutorRegistry::builtin()).0
    }

    fn trigger() -> Node {
        Node::new("start", NodeType::ManualTrigger, json!({}))
    }

    fn code(id: &str, expression: &str) -> Node {
        Node::new(id, NodeType::Code, json!({ "code": expression }))
    }

    async fn save(engine: &Engine, nodes: Vec<Node>, edges: Vec<Edge>) -> WorkflowId {
        let id = WorkflowId::new();
        engine
            .save_workflow(id, WorkflowDraft::graph(nodes, edges).named("test"), None)
            .await
            .expect("save");
        id
    }

    #[tokio::test]
    async fn untaken_branch_is_skipped() {
        let engine = engine();
        let id = save(
            &engine,
            vec![
                trigger(),
                Node::new("check", NodeType::If, json!({ "condition": "$json.amount > 100" })),
                code("big", "'big'"),
                code("small", "'small'"),
            ],
            vec![
                Edge::new("start", "check"),
                Edge::on_branch("check", "big", "true"),
                Edge::on_branch("check", "small", "false"),
            ],
        )
        .await;

        let execution = engine
            .run_to_completion(ExecutionRequest::manual(id, json!({ "amount": 250 })))
            .await
            .expect("run");
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.output_data, Some(json!("big")));
        let small = execution.node_run(&NodeId::new("small")).expect("recorded");
        assert_eq!(small.status, NodeRunStatus::Skipped);
        assert!(!small.invoked);
        assert_eq!(execution.invoked_count(), 3);
    }

    #[tokio::test]
    async fn merge_combines_both_branches() {
        let engine = engine();
        let id = save(
            &engine,
            vec![
                trigger(),
                code("left", "[1, 2]"),
                code("right", "[3, 4]"),
                Node::new("merge", NodeType::Merge, json!({ "mode": "append" })),
            ],
            vec![
                Edge::new("start", "left"),
                Edge::new("start", "right"),
                Edge::new("left", "merge"),
                Edge::new("right", "merge"),
            ],
        )
        .await;

        let execution = engine
            .run_to_completion(ExecutionRequest::manual(id, json!({})))
            .await
            .expect("run");
        assert_eq!(execution.status, ExecutionStatus::Success);
        let Some(JsonValue::Array(mut items)) = execution.output_data else {
            panic!("expected an array output");
        };
        items.sort_by_key(|v| v.as_i64());
        assert_eq!(items, vec![json!(1), json!(2), json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn multiplexed_merge_runs_the_next_node_once_per_item() {
        let counting = Counting::default();
        let registry = ExecutorRegistry::builtin().with(NodeType::Code, counting.clone());
        let (engine, _) = engine_with(registry);
        let id = save(
            &engine,
            vec![
                trigger(),
                code("left", "1"),
                code("middle", "2"),
                code("right", "3"),
                Node::new("merge", NodeType::Merge, json!({ "mode": "multiplex" })),
                code("each", "$json * 10"),
            ],
            vec![
                Edge::new("start", "left"),
                Edge::new("start", "middle"),
                Edge::new("start", "right"),
                Edge::new("left", "merge"),
                Edge::new("middle", "merge"),
                Edge::new("right", "merge"),
                Edge::new("merge", "each"),
            ],
        )
        .await;

        let execution = engine
            .run_to_completion(ExecutionRequest::manual(id, json!({})))
            .await
            .expect("run");
        assert_eq!(execution.status, ExecutionStatus::Success);
        // Three branch nodes, then one `each` call per merged item.
        assert_eq!(counting.calls.load(Ordering::SeqCst), 6);
        let Some(JsonValue::Array(mut items)) = execution.output_data else {
            panic!("expected an array output");
        };
        items.sort_by_key(|v| v.as_i64());
        assert_eq!(items, vec![json!(10), json!(20), json!(30)]);
    }

    #[tokio::test(start_paused = true)]
    async fn sibling_waits_overlap() {
        let engine = engine();
        let id = save(
            &engine,
            vec![
                trigger(),
                Node::new("short", NodeType::Wait, json!({ "duration": 2 })),
                Node::new("long", NodeType::Wait, json!({ "duration": 3 })),
                code("join", "'joined'"),
            ],
            vec![
                Edge::new("start", "short"),
                Edge::new("start", "long"),
                Edge::new("short", "join"),
                Edge::new("long", "join"),
            ],
        )
        .await;

        let started = tokio::time::Instant::now();
        let execution = engine
            .run_to_completion(ExecutionRequest::manual(id, json!({})))
            .await
            .expect("run");
        let elapsed = started.elapsed();

        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.output_data, Some(json!("joined")));
        assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");
        let join = execution.node_run(&NodeId::new("join")).expect("recorded");
        assert_eq!(join.status, NodeRunStatus::Success);
    }

    #[tokio::test]
    async fn unreachable_nodes_are_not_run() {
        let counting = Counting::default();
        let registry = ExecutorRegistry::builtin().with(NodeType::Code, counting.clone());
        let (engine, _) = engine_with(registry);
        let id = save(
            &engine,
            vec![trigger(), code("reached", "1"), code("orphan", "2")],
            vec![Edge::new("start", "reached")],
        )
        .await;

        let execution = engine
            .run_to_completion(ExecutionRequest::manual(id, json!({})))
            .await
            .expect("run");
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
        assert!(execution.node_run(&NodeId::new("orphan")).is_none());
    }

    #[tokio::test]
    async fn cycle_fails_before_any_node_runs() {
        let counting = Counting::default();
        let registry = ExecutorRegistry::builtin().with(NodeType::Code, counting.clone());
        let (engine, _) = engine_with(registry);
        let id = save(
            &engine,
            vec![trigger(), code("a", "1"), code("b", "2"), code("c", "3")],
            vec![
                Edge::new("start", "a"),
                Edge::new("a", "b"),
                Edge::new("b", "c"),
                Edge::new("c", "a"),
            ],
        )
        .await;

        let execution = engine
            .run_to_completion(ExecutionRequest::manual(id, json!({})))
            .await
            .expect("run");
        assert_eq!(execution.status, ExecutionStatus::Error);
        assert!(execution.node_runs.is_empty());
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
        let failure = execution.error.expect("failure");
        assert!(failure.node_id.is_none());
        assert!(failure.message.contains("cycle"), "{}", failure.message);
    }

    #[tokio::test]
    async fn pending_execution_runs_once() {
        let counting = Counting::default();
        let registry = ExecutorRegistry::builtin().with(NodeType::Code, counting.clone());
        let (engine, _) = engine_with(registry);
        let id = save(&engine, vec![trigger(), code("once", "1")], vec![Edge::new("start", "once")])
            .await;
        let execution = engine
            .create_execution(ExecutionRequest::manual(id, json!({})))
            .await
            .expect("create");

        let (first, second) = tokio::join!(
            engine.run(execution.id, CancellationToken::new(), 0),
            engine.run(execution.id, CancellationToken::new(), 0),
        );
        first.expect("first");
        second.expect("second");
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);

        let again = engine
            .run(execution.id, CancellationToken::new(), 0)
            .await
            .expect("third");
        assert_eq!(again.status, ExecutionStatus::Success);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let registry = ExecutorRegistry::builtin().with(
            NodeType::HttpRequest,
            Flaky {
                failures: AtomicU32::new(2),
                retryable: true,
            },
        );
        let (engine, _) = engine_with(registry);
        let id = save(
            &engine,
            vec![
                trigger(),
                Node::new("call", NodeType::HttpRequest, json!({ "url": "https://example.com" })),
            ],
            vec![Edge::new("start", "call")],
        )
        .await;

        let execution = engine
            .run_to_completion(ExecutionRequest::manual(id, json!({})))
            .await
            .expect("run");
        assert_eq!(execution.status, ExecutionStatus::Success);
        let run = execution.node_run(&NodeId::new("call")).expect("recorded");
        assert_eq!(run.attempts, 3);
        assert_eq!(run.output, Some(json!("recovered")));
    }

    #[tokio::test]
    async fn permanent_failure_stops_the_run() {
        let counting = Counting::default();
        let registry = ExecutorRegistry::builtin()
            .with(
                NodeType::HttpRequest,
                Flaky {
                    failures: AtomicU32::new(10),
                    retryable: false,
                },
            )
            .with(NodeType::Code, counting.clone());
        let (engine, _) = engine_with(registry);
        let id = save(
            &engine,
            vec![
                trigger(),
                Node::new("call", NodeType::HttpRequest, json!({ "url": "https://example.com" })),
                code("after", "1"),
            ],
            vec![Edge::new("start", "call"), Edge::new("call", "after")],
        )
        .await;

        let execution = engine
            .run_to_completion(ExecutionRequest::manual(id, json!({})))
            .await
            .expect("run");
        assert_eq!(execution.status, ExecutionStatus::Error);
        assert_eq!(
            execution.error.as_ref().and_then(|f| f.node_id.clone()),
            Some(NodeId::new("call"))
        );
        assert_eq!(execution.node_run(&NodeId::new("call")).expect("run").attempts, 1);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_node_times_out_after_every_attempt() {
        let registry = ExecutorRegistry::builtin().with(NodeType::HttpRequest, Stalling);
        let (engine, _) = engine_with(registry);
        let id = save(
            &engine,
            vec![
                trigger(),
                Node::new("call", NodeType::HttpRequest, json!({ "url": "https://example.com" })),
            ],
            vec![Edge::new("start", "call")],
        )
        .await;

        let execution = engine
            .run_to_completion(ExecutionRequest::manual(id, json!({})))
            .await
            .expect("run");
        assert_eq!(execution.status, ExecutionStatus::Error);
        let run = execution.node_run(&NodeId::new("call")).expect("recorded");
        assert_eq!(run.attempts, engine.config().max_attempts);
        assert_eq!(run.error.as_ref().map(|e| e.kind), Some(NodeErrorKind::Timeout));
    }

    #[tokio::test]
    async fn failed_run_alerts_and_retries_from_a_new_record() {
        let registry = ExecutorRegistry::builtin().with(
            NodeType::HttpRequest,
            Flaky {
                failures: AtomicU32::new(1),
                retryable: false,
            },
        );
        let (engine, alerts) = engine_with(registry);
        let id = WorkflowId::new();
        engine
            .save_workflow(
                id,
                WorkflowDraft::graph(
                    vec![
                        trigger(),
                        Node::new("call", NodeType::HttpRequest, json!({ "url": "https://example.com" })),
                    ],
                    vec![Edge::new("start", "call")],
                )
                .alerts(ErrorAlertConfig {
                    enabled: true,
                    webhook_url: Some("https://hooks.example.com/fail".into()),
                    include_input: false,
                }),
                None,
            )
            .await
            .expect("save");

        let failed = engine
            .run_to_completion(ExecutionRequest::manual(id, json!({ "n": 1 })))
            .await
            .expect("run");
        assert_eq!(failed.status, ExecutionStatus::Error);
        {
            let sent = alerts.sent.lock().unwrap_or_else(PoisonError::into_inner);
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].0, "https://hooks.example.com/fail");
            assert_eq!(sent[0].1.execution_id, failed.id);
        }

        let retry_id = engine.retry_execution(failed.id, None).await.expect("retry");
        assert_ne!(retry_id, failed.id);
        let retry = engine.get_execution(retry_id).await.expect("retry record");
        assert_eq!(retry.retry_of, Some(failed.id));
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.input_data, json!({ "n": 1 }));
        assert_eq!(
            engine.get_execution(failed.id).await.expect("original"),
            failed
        );
    }

    #[tokio::test]
    async fn successful_run_cannot_be_retried_or_cancelled() {
        let engine = engine();
        let id = save(&engine, vec![trigger()], vec![]).await;
        let done = engine
            .run_to_completion(ExecutionRequest::manual(id, json!({})))
            .await
            .expect("run");
        assert_eq!(done.status, ExecutionStatus::Success);

        let retry = engine.retry_execution(done.id, None).await.unwrap_err();
        assert!(matches!(retry.current_context(), EngineError::InvalidTransition(_)));
        let cancel = engine.cancel_execution(done.id).await.unwrap_err();
        assert!(matches!(cancel.current_context(), EngineError::InvalidTransition(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_waiting_run_discards_the_rest() {
        let counting = Counting::default();
        let registry = ExecutorRegistry::builtin().with(NodeType::Code, counting.clone());
        let (engine, _) = engine_with(registry);
        let id = save(
            &engine,
            vec![
                trigger(),
                Node::new("pause", NodeType::Wait, json!({ "duration": 60 })),
                code("after", "1"),
            ],
            vec![Edge::new("start", "pause"), Edge::new("pause", "after")],
        )
        .await;

        let execution_id = engine
            .execute_workflow(ExecutionRequest::manual(id, json!({})))
            .await
            .expect("queue");
        let mut status = ExecutionStatus::Pending;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = engine.get_execution(execution_id).await.expect("get").status;
            if status == ExecutionStatus::Waiting {
                break;
            }
        }
        assert_eq!(status, ExecutionStatus::Waiting);

        let deleted = engine.delete_execution(execution_id).await.unwrap_err();
        assert!(matches!(deleted.current_context(), EngineError::ExecutionActive { .. }));

        let cancelled = engine.cancel_execution(execution_id).await.expect("cancel");
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        tokio::time::sleep(Duration::from_secs(120)).await;

        let stored = engine.get_execution(execution_id).await.expect("get");
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
        assert!(stored.node_run(&NodeId::new("after")).is_none());
        engine.delete_execution(execution_id).await.expect("delete");
    }

    #[tokio::test]
    async fn execution_runs_the_version_it_was_created_against() {
        let engine = engine();
        let id = save(&engine, vec![trigger(), code("out", "'v1'")], vec![Edge::new("start", "out")])
            .await;
        let pending = engine
            .create_execution(ExecutionRequest::manual(id, json!({})))
            .await
            .expect("create");
        engine
            .save_workflow(
                id,
                WorkflowDraft::graph(
                    vec![trigger(), code("out", "'v2'")],
                    vec![Edge::new("start", "out")],
                ),
                None,
            )
            .await
            .expect("save");

        let done = engine
            .run(pending.id, CancellationToken::new(), 0)
            .await
            .expect("run");
        assert_eq!(done.workflow_version, 1);
        assert_eq!(done.output_data, Some(json!("v1")));
    }

    #[tokio::test]
    async fn versions_increase_and_rollback_restores() {
        let engine = engine();
        let id = save(&engine, vec![trigger(), code("out", "'a'")], vec![Edge::new("start", "out")])
            .await;
        for text in ["'b'", "'c'"] {
            engine
                .save_workflow(
                    id,
                    WorkflowDraft::graph(
                        vec![trigger(), code("out", text)],
                        vec![Edge::new("start", "out")],
                    ),
                    None,
                )
                .await
                .expect("save");
        }
        let versions = engine.list_versions(id).await.expect("versions");
        let numbers: Vec<u32> = versions.iter().map(|v| v.version_num).collect();
        assert_eq!(numbers, vec![1, 2]);

        let restored = engine.rollback_workflow(id, 1, None).await.expect("rollback");
        assert_eq!(restored.version, 4);
        assert_eq!(restored.nodes, versions[0].nodes);

        let missing = engine.rollback_workflow(id, 99, None).await.unwrap_err();
        assert!(matches!(
            missing.current_context(),
            EngineError::Version(VersionError::VersionNotFound { version_num: 99, .. })
        ));
    }

    #[tokio::test]
    async fn metadata_save_keeps_the_version() {
        let engine = engine();
        let id = save(&engine, vec![trigger()], vec![]).await;
        let renamed = engine
            .save_workflow(id, WorkflowDraft::default().named("renamed").active(true), None)
            .await
            .expect("save");
        assert_eq!(renamed.version, 1);
        assert!(renamed.is_active);
        assert_eq!(engine.get_workflow(id).await.expect("get").name, "renamed");
        assert!(engine.list_versions(id).await.expect("versions").is_empty());
    }

    #[tokio::test]
    async fn webhook_requires_active_workflow_and_known_path() {
        let engine = engine();
        let id = save(
            &engine,
            vec![
                Node::new("hook", NodeType::WebhookTrigger, json!({ "path": "orders" })),
                code("out", "$json.total"),
            ],
            vec![Edge::new("hook", "out")],
        )
        .await;
        engine
            .save_workflow(id, WorkflowDraft::default().active(false), None)
            .await
            .expect("deactivate");

        let inactive = engine.webhook(id, "orders", json!({})).await.unwrap_err();
        assert!(matches!(inactive.current_context(), EngineError::WorkflowInactive { .. }));

        engine
            .save_workflow(id, WorkflowDraft::default().active(true), None)
            .await
            .expect("activate");
        let unknown = engine.webhook(id, "refunds", json!({})).await.unwrap_err();
        assert!(matches!(unknown.current_context(), EngineError::WebhookNotFound { .. }));

        let execution_id = engine
            .webhook(id, "orders", json!({ "total": 12 }))
            .await
            .expect("fire");
        let execution = engine.get_execution(execution_id).await.expect("get");
        assert_eq!(execution.mode, ExecutionMode::Webhook);
        assert_eq!(execution.fired_trigger, Some(NodeId::new("hook")));
    }

    #[tokio::test]
    async fn sync_sub_workflow_returns_child_output() {
        let engine = engine();
        let child = save(
            &engine,
            vec![trigger(), code("double", "$json.n * 2")],
            vec![Edge::new("start", "double")],
        )
        .await;
        let parent = save(
            &engine,
            vec![
                trigger(),
                Node::new(
                    "call",
                    NodeType::SubWorkflow,
                    json!({ "workflowId": child.to_string(), "waitMode": "sync" }),
                ),
            ],
            vec![Edge::new("start", "call")],
        )
        .await;

        let execution = engine
            .run_to_completion(ExecutionRequest::manual(parent, json!({ "n": 21 })))
            .await
            .expect("run");
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.output_data, Some(json!(42)));
        assert_eq!(engine.list_executions(child).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let engine = engine();
        let missing = engine.get_execution(ExecutionId::new()).await.unwrap_err();
        assert!(matches!(missing.current_context(), EngineError::ExecutionNotFound { .. }));
        let missing = engine
            .execute_workflow(ExecutionRequest::manual(WorkflowId::new(), json!({})))
            .await
            .unwrap_err();
        assert!(matches!(missing.current_context(), EngineError::WorkflowNotFound { .. }));
    }
}
