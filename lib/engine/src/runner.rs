//! Drives one execution from PENDING to a terminal state.
//!
//! The runner plans the graph, then dispatches it level by level:
//! - nodes of a level run concurrently, bounded by `max_level_concurrency`
//! - the next level starts only once every node of the current one finished
//! - readiness is re-checked at dispatch time, so untaken branches are
//!   recorded as skipped and never invoked
//! - a node that keeps failing stops scheduling; nodes already in flight in
//!   the same level are allowed to finish
//!
//! Every write to the execution record is conditional on the status the
//! runner last wrote. When that check fails (the user cancelled, or another
//! writer got there first) the runner stops and returns the stored record.

use crate::alert::{AlertSink, ErrorAlert};
use crate::config::EngineConfig;
use crate::error::{EngineError, StoreError};
use crate::executor::{
    ExecutorRegistry, NodeContext, NodeExecutor, RunScope, Services, SubWorkflowLauncher,
    Suspension,
};
use crate::store::{ExecutionStore, WorkflowStore};
use flowforge_core::{ExecutionId, Result};
use flowforge_workflow::expression::merge_inputs;
use flowforge_workflow::{
    Edge, Execution, ExecutionFailure, ExecutionStatus, GraphError, Node, NodeError, NodeOutput,
    NodeRun, PlannedNode, Readiness, RunState, Schedule, Workflow, WorkflowGraph, plan,
};
use futures::stream::{self, StreamExt};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Converts a store report into an engine report.
pub(crate) fn stored<T>(result: Result<T, StoreError>) -> Result<T, EngineError> {
    result.map_err(|report| EngineError::from(report.current_context()).into())
}

/// Everything a runner needs; built per run by the engine.
pub(crate) struct Runner {
    pub executions: Arc<dyn ExecutionStore>,
    pub workflows: Arc<dyn WorkflowStore>,
    pub registry: Arc<ExecutorRegistry>,
    pub services: Arc<Services>,
    pub alerts: Arc<dyn AlertSink>,
    pub launcher: Option<Arc<dyn SubWorkflowLauncher>>,
}

/// The execution as the runner sees it, plus the status it last persisted.
struct Tracker<'a> {
    store: &'a dyn ExecutionStore,
    execution: Execution,
    persisted: ExecutionStatus,
}

impl Tracker<'_> {
    /// Writes the record; false means someone else changed it first.
    async fn save(&mut self) -> Result<bool, EngineError> {
        let saved = stored(self.store.update_if(self.persisted, &self.execution).await)?;
        if saved {
            self.persisted = self.execution.status;
        } else {
            warn!(
                execution_id = %self.execution.id,
                expected = %self.persisted,
                "execution changed underneath the runner, stopping"
            );
        }
        Ok(saved)
    }

    async fn reload(&self) -> Result<Execution, EngineError> {
        stored(self.store.get(self.execution.id).await)
    }
}

/// The result of all invocations of one node.
struct NodeOutcome {
    result: std::result::Result<NodeOutput, NodeError>,
    attempts: u32,
}

impl Runner {
    /// Runs the execution if it is still PENDING.
    ///
    /// Any other state is left alone and the stored record is returned, so
    /// calling this twice for the same id advances the execution once.
    ///
    /// # Errors
    ///
    /// Returns an error only when the execution or workflow record cannot be
    /// read or written. Workflow failures end up on the returned record.
    #[instrument(skip(self, cancel), fields(execution_id = %id, depth))]
    pub async fn run(
        &self,
        id: ExecutionId,
        cancel: CancellationToken,
        depth: u32,
    ) -> Result<Execution, EngineError> {
        let execution = stored(self.executions.get(id).await)?;
        if execution.status != ExecutionStatus::Pending {
            debug!(status = %execution.status, "execution already picked up");
            return Ok(execution);
        }

        let workflow = match self.workflows.get(execution.workflow_id).await {
            Ok(workflow) => workflow,
            Err(report) if matches!(report.current_context(), StoreError::NotFound { .. }) => {
                let failure = ExecutionFailure::planning(report.current_context().to_string());
                return self.fail_pending(execution, failure, None).await;
            }
            Err(report) => return Err(EngineError::from(report.current_context()).into()),
        };

        let (nodes, edges) = self.graph_source(&workflow, execution.workflow_version).await?;
        let (graph, schedule) = match self.plan(&nodes, &edges, &execution) {
            Ok(planned) => planned,
            Err(e) => {
                warn!(error = %e, "planning failed");
                let failure = ExecutionFailure::planning(e.to_string());
                return self.fail_pending(execution, failure, Some(&workflow)).await;
            }
        };

        let Some(started) = stored(self.executions.try_start(id).await)? else {
            debug!("another runner started this execution");
            return stored(self.executions.get(id).await);
        };
        info!(
            workflow_id = %workflow.id,
            version = started.workflow_version,
            scheduled = schedule.len(),
            excluded = schedule.excluded.len(),
            "execution started"
        );

        let mut tracker = Tracker {
            store: &*self.executions,
            persisted: started.status,
            execution: started,
        };
        self.drive(&mut tracker, &workflow, &graph, &schedule, cancel, depth)
            .await
    }

    /// The nodes and edges of the workflow version the execution was created
    /// against.
    async fn graph_source(
        &self,
        workflow: &Workflow,
        version: u32,
    ) -> Result<(Vec<Node>, Vec<Edge>), EngineError> {
        if version == workflow.version {
            return Ok((workflow.nodes.clone(), workflow.edges.clone()));
        }
        match stored(self.workflows.version(workflow.id, version).await)? {
            Some(snapshot) => Ok((snapshot.nodes, snapshot.edges)),
            None => {
                warn!(
                    requested = version,
                    current = workflow.version,
                    "no snapshot for the execution's version, running the current graph"
                );
                Ok((workflow.nodes.clone(), workflow.edges.clone()))
            }
        }
    }

    fn plan(
        &self,
        nodes: &[Node],
        edges: &[Edge],
        execution: &Execution,
    ) -> std::result::Result<(WorkflowGraph, Schedule), GraphError> {
        let graph = WorkflowGraph::build(nodes, edges)?;
        let schedule = plan(&graph, execution.fired_trigger.as_ref())?;
        self.registry.check(&graph, &schedule)?;
        Ok((graph, schedule))
    }

    /// PENDING -> ERROR before any node ran.
    async fn fail_pending(
        &self,
        mut execution: Execution,
        failure: ExecutionFailure,
        workflow: Option<&Workflow>,
    ) -> Result<Execution, EngineError> {
        execution.fail(failure).map_err(EngineError::from)?;
        if !stored(
            self.executions
                .update_if(ExecutionStatus::Pending, &execution)
                .await,
        )? {
            return stored(self.executions.get(execution.id).await);
        }
        if let Some(workflow) = workflow {
            self.alert(workflow, &execution).await;
        }
        Ok(execution)
    }

    async fn drive(
        &self,
        tracker: &mut Tracker<'_>,
        workflow: &Workflow,
        graph: &WorkflowGraph,
        schedule: &Schedule,
        cancel: CancellationToken,
        depth: u32,
    ) -> Result<Execution, EngineError> {
        let (suspensions, mut signals) = mpsc::unbounded_channel();
        let scope = RunScope {
            execution_id: tracker.execution.id,
            workflow_id: workflow.id,
            mode: tracker.execution.mode,
            trigger: Arc::new(tracker.execution.input_data.clone()),
            services: Arc::clone(&self.services),
            launcher: self.launcher.clone(),
            cancel: cancel.clone(),
            depth,
            suspensions,
        };
        let mut state = RunState::new(tracker.execution.input_data.clone());
        let mut failure: Option<NodeError> = None;

        for (level_index, level) in schedule.levels.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }

            let mut jobs = Vec::new();
            for node_id in level {
                let Some(node) = graph.node(node_id) else {
                    continue;
                };
                match state.readiness(graph, schedule, node_id) {
                    Readiness::Dispatch(invocations) => {
                        tracker.execution.record_node_run(NodeRun::started(
                            node.id.clone(),
                            node.node_type.as_str(),
                            recorded_input(&invocations),
                        ));
                        jobs.push((node.clone(), invocations));
                    }
                    readiness => {
                        if readiness == Readiness::Blocked {
                            warn!(node_id = %node.id, "predecessor did not complete, skipping");
                        } else {
                            debug!(node_id = %node.id, "no incoming branch taken, skipping");
                        }
                        state.mark_skipped(node.id.clone());
                        tracker
                            .execution
                            .record_node_run(NodeRun::skipped(node.id.clone(), node.node_type.as_str()));
                    }
                }
            }
            if !tracker.save().await? {
                return tracker.reload().await;
            }
            if jobs.is_empty() {
                continue;
            }

            debug!(level = level_index, nodes = jobs.len(), "dispatching level");
            let nodes = Arc::new(state.outputs_by_id());
            let Some(results) = self
                .run_level(jobs, &scope, nodes, tracker, &mut signals)
                .await?
            else {
                cancel.cancel();
                return tracker.reload().await;
            };

            if cancel.is_cancelled() {
                break;
            }
            for (node, outcome) in results {
                let mut run = tracker.execution.node_run(&node.id).cloned().unwrap_or_else(|| {
                    NodeRun::started(node.id.clone(), node.node_type.as_str(), JsonValue::Null)
                });
                run.attempts = outcome.attempts;
                match outcome.result {
                    Ok(output) => {
                        run.succeed(output.to_json(), output.taken_branch().map(str::to_string));
                        state.mark_completed(node.id.clone(), output);
                    }
                    Err(e) => {
                        warn!(node_id = %node.id, kind = %e.kind, error = %e.message, "node failed");
                        run.fail(e.clone());
                        state.mark_failed(node.id.clone());
                        failure.get_or_insert(e);
                    }
                }
                tracker.execution.record_node_run(run);
            }
            if failure.is_some() {
                break;
            }
            if !tracker.save().await? {
                return tracker.reload().await;
            }
        }

        if let Some(e) = failure {
            tracker
                .execution
                .fail(ExecutionFailure::from(&e))
                .map_err(EngineError::from)?;
            error!(node_id = %e.node_id, kind = %e.kind, error = %e.message, "execution failed");
            if !tracker.save().await? {
                return tracker.reload().await;
            }
            self.alert(workflow, &tracker.execution).await;
            return Ok(tracker.execution.clone());
        }

        if cancel.is_cancelled() {
            tracker.execution.cancel().map_err(EngineError::from)?;
            info!("execution cancelled");
            if !tracker.save().await? {
                return tracker.reload().await;
            }
            return Ok(tracker.execution.clone());
        }

        tracker
            .execution
            .succeed(state.terminal_output(schedule))
            .map_err(EngineError::from)?;
        if !tracker.save().await? {
            return tracker.reload().await;
        }
        info!(
            duration_ms = tracker.execution.duration_ms,
            invoked = tracker.execution.invoked_count(),
            "execution succeeded"
        );
        Ok(tracker.execution.clone())
    }

    /// Runs one level, tracking WAITING while any node is suspended.
    ///
    /// Returns `None` if the record changed underneath the runner.
    async fn run_level(
        &self,
        jobs: Vec<(PlannedNode, Vec<Vec<JsonValue>>)>,
        scope: &RunScope,
        nodes: Arc<HashMap<String, JsonValue>>,
        tracker: &mut Tracker<'_>,
        signals: &mut mpsc::UnboundedReceiver<Suspension>,
    ) -> Result<Option<Vec<(PlannedNode, NodeOutcome)>>, EngineError> {
        let config = &self.services.config;
        let level = stream::iter(jobs)
            .map(|(node, invocations)| {
                let ctx = NodeContext::new(scope, node.id.clone(), Arc::clone(&nodes));
                let executor = self.registry.get(node.node_type);
                async move {
                    let outcome = match executor {
                        Some(executor) => {
                            invoke(executor.as_ref(), &node, invocations, &ctx, config).await
                        }
                        None => NodeOutcome {
                            result: Err(ctx.config_invalid(format!(
                                "no executor for node type '{}'",
                                node.node_type
                            ))),
                            attempts: 0,
                        },
                    };
                    (node, outcome)
                }
            })
            .buffered(config.max_level_concurrency.max(1))
            .collect::<Vec<_>>();
        tokio::pin!(level);

        let mut suspended = 0usize;
        let results = loop {
            tokio::select! {
                results = &mut level => break results,
                Some(signal) = signals.recv() => {
                    if !self.on_suspension(signal, &mut suspended, tracker).await? {
                        return Ok(None);
                    }
                }
            }
        };
        while let Ok(signal) = signals.try_recv() {
            if !self.on_suspension(signal, &mut suspended, tracker).await? {
                return Ok(None);
            }
        }
        if tracker.execution.status == ExecutionStatus::Waiting {
            tracker.execution.resume().map_err(EngineError::from)?;
            if !tracker.save().await? {
                return Ok(None);
            }
        }
        Ok(Some(results))
    }

    async fn on_suspension(
        &self,
        signal: Suspension,
        suspended: &mut usize,
        tracker: &mut Tracker<'_>,
    ) -> Result<bool, EngineError> {
        match signal {
            Suspension::Enter => {
                *suspended += 1;
                if *suspended == 1 && tracker.execution.wait().is_ok() {
                    debug!("execution waiting");
                    return tracker.save().await;
                }
            }
            Suspension::Leave => {
                *suspended = suspended.saturating_sub(1);
                if *suspended == 0 && tracker.execution.resume().is_ok() {
                    debug!("execution resumed");
                    return tracker.save().await;
                }
            }
        }
        Ok(true)
    }

    async fn alert(&self, workflow: &Workflow, execution: &Execution) {
        let Some(target) = workflow.error_alerts.target() else {
            return;
        };
        let Some(alert) = ErrorAlert::for_execution(workflow, execution) else {
            return;
        };
        match self.alerts.deliver(target, &alert).await {
            Ok(()) => debug!(execution_id = %execution.id, "error alert sent"),
            Err(report) => warn!(
                execution_id = %execution.id,
                error = %report.current_context(),
                "error alert delivery failed"
            ),
        }
    }
}

/// What a node-run record shows as input: the merged `$json`, or one per
/// invocation when the node fans out.
fn recorded_input(invocations: &[Vec<JsonValue>]) -> JsonValue {
    match invocations {
        [single] => merge_inputs(single),
        many => JsonValue::Array(many.iter().map(|inputs| merge_inputs(inputs)).collect()),
    }
}

/// Calls the executor once per invocation, retrying retryable failures.
async fn invoke(
    executor: &dyn NodeExecutor,
    node: &PlannedNode,
    invocations: Vec<Vec<JsonValue>>,
    ctx: &NodeContext,
    config: &EngineConfig,
) -> NodeOutcome {
    let mut outputs = Vec::with_capacity(invocations.len());
    let mut attempts = 0;
    for inputs in &invocations {
        let mut attempt = 0;
        loop {
            attempt += 1;
            attempts += 1;
            let call = executor.execute(&node.config, inputs, ctx);
            let limit = executor.timeout(&node.config, config);
            let result = tokio::time::timeout(limit, call)
                .await
                .unwrap_or_else(|_| Err(NodeError::timeout(node.id.clone(), limit)));
            match result {
                Ok(output) => {
                    outputs.push(output);
                    break;
                }
                Err(e) if e.retryable && attempt < config.max_attempts && !ctx.cancel.is_cancelled() => {
                    let delay = config.backoff(attempt);
                    warn!(
                        node_id = %node.id,
                        attempt,
                        kind = %e.kind,
                        error = %e.message,
                        delay_ms = delay.as_millis() as u64,
                        "retrying node"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = ctx.cancel.cancelled() => {
                            return NodeOutcome { result: Err(e), attempts };
                        }
                    }
                }
                Err(e) => return NodeOutcome { result: Err(e), attempts },
            }
        }
    }
    NodeOutcome {
        result: Ok(NodeOutput::concat(outputs)),
        attempts,
    }
}
