//! Execution records and their state machine.
//!
//! ```text
//! PENDING ──start──▶ RUNNING ──succeed──▶ SUCCESS
//!    │                 │  ▲
//!    │              wait  resume
//!    │                 ▼  │
//!    │               WAITING
//!    │
//!    └──────── fail / cancel (from PENDING, RUNNING or WAITING) ──▶ ERROR / CANCELLED
//! ```
//!
//! Transitions are the only mutations. A retry never touches the original
//! record; [`Execution::new_retry`] builds a fresh PENDING execution that
//! points back at it.

use crate::error::{NodeError, TransitionError};
use crate::node::NodeId;
use chrono::{DateTime, Utc};
use flowforge_core::{ExecutionId, NodeRunId, UserId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

/// Error returned when parsing a status or mode string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStatusError(pub String);

impl fmt::Display for ParseStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized value: {}", self.0)
    }
}

impl std::error::Error for ParseStatusError {}

/// The lifecycle state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Created, not yet picked up by a runner.
    Pending,
    /// A runner owns this execution.
    Running,
    /// Suspended on a `wait` or synchronous `sub-workflow` node.
    Waiting,
    /// Every reachable node completed.
    Success,
    /// A node failed for good, or the graph could not be planned.
    Error,
    /// Stopped by the user.
    Cancelled,
}

impl ExecutionStatus {
    /// Returns true if no further transitions are possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }

    /// Returns true if a runner may still advance this execution.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Waiting)
    }

    /// Returns the database representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Waiting => "WAITING",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "WAITING" => Ok(Self::Waiting),
            "SUCCESS" => Ok(Self::Success),
            "ERROR" => Ok(Self::Error),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// How an execution was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Manual,
    Webhook,
    Schedule,
}

impl ExecutionMode {
    /// Returns the database representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Webhook => "WEBHOOK",
            Self::Schedule => "SCHEDULE",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MANUAL" => Ok(Self::Manual),
            "WEBHOOK" => Ok(Self::Webhook),
            "SCHEDULE" => Ok(Self::Schedule),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Why an execution ended in ERROR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFailure {
    /// The failing node; `None` for planning failures.
    pub node_id: Option<NodeId>,
    pub message: String,
}

impl ExecutionFailure {
    #[must_use]
    pub fn planning(message: impl Into<String>) -> Self {
        Self {
            node_id: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn node(node_id: NodeId, message: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id),
            message: message.into(),
        }
    }
}

impl From<&NodeError> for ExecutionFailure {
    fn from(error: &NodeError) -> Self {
        Self::node(error.node_id.clone(), error.message.clone())
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(node) => write!(f, "node {node}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// The state of one node within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRunStatus {
    Pending,
    Running,
    Success,
    Error,
    /// Not invoked because no incoming edge was taken.
    Skipped,
    /// In flight when the execution was cancelled; its result was discarded.
    Cancelled,
}

impl NodeRunStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Record of a single node within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRun {
    pub id: NodeRunId,
    pub node_id: NodeId,
    pub node_type: String,
    pub status: NodeRunStatus,
    /// Whether the executor was ever called.
    pub invoked: bool,
    /// Executor calls made, including retries.
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub input: Option<JsonValue>,
    pub output: Option<JsonValue>,
    /// Branch the output was tagged with, for `if`/`switch`.
    pub branch: Option<String>,
    pub error: Option<NodeError>,
}

impl NodeRun {
    /// Creates a running record for a node about to be invoked.
    #[must_use]
    pub fn started(node_id: NodeId, node_type: impl Into<String>, input: JsonValue) -> Self {
        Self {
            id: NodeRunId::new(),
            node_id,
            node_type: node_type.into(),
            status: NodeRunStatus::Running,
            invoked: true,
            attempts: 0,
            started_at: Some(Utc::now()),
            finished_at: None,
            input: Some(input),
            output: None,
            branch: None,
            error: None,
        }
    }

    /// Creates the record of a node whose incoming branches were all untaken.
    #[must_use]
    pub fn skipped(node_id: NodeId, node_type: impl Into<String>) -> Self {
        Self {
            id: NodeRunId::new(),
            node_id,
            node_type: node_type.into(),
            status: NodeRunStatus::Skipped,
            invoked: false,
            attempts: 0,
            started_at: None,
            finished_at: Some(Utc::now()),
            input: None,
            output: None,
            branch: None,
            error: None,
        }
    }

    pub fn succeed(&mut self, output: JsonValue, branch: Option<String>) {
        self.status = NodeRunStatus::Success;
        self.output = Some(output);
        self.branch = branch;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: NodeError) {
        self.status = NodeRunStatus::Error;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.status = NodeRunStatus::Cancelled;
        self.finished_at = Some(Utc::now());
    }
}

/// One run attempt of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    /// The workflow version that was current when the run was created.
    pub workflow_version: u32,
    pub triggered_by: Option<UserId>,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    /// The specific trigger node that fired, if known.
    pub fired_trigger: Option<NodeId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Milliseconds between start and finish.
    pub duration_ms: Option<i64>,
    pub input_data: JsonValue,
    pub output_data: Option<JsonValue>,
    pub error: Option<ExecutionFailure>,
    pub retry_count: u32,
    pub retry_of: Option<ExecutionId>,
    #[serde(default)]
    pub node_runs: Vec<NodeRun>,
}

impl Execution {
    /// Creates a PENDING execution.
    #[must_use]
    pub fn new(
        workflow_id: WorkflowId,
        workflow_version: u32,
        mode: ExecutionMode,
        input_data: JsonValue,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            workflow_id,
            workflow_version,
            triggered_by: None,
            mode,
            status: ExecutionStatus::Pending,
            fired_trigger: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            input_data,
            output_data: None,
            error: None,
            retry_count: 0,
            retry_of: None,
            node_runs: Vec::new(),
        }
    }

    #[must_use]
    pub fn triggered_by(mut self, user: UserId) -> Self {
        self.triggered_by = Some(user);
        self
    }

    #[must_use]
    pub fn with_fired_trigger(mut self, node: NodeId) -> Self {
        self.fired_trigger = Some(node);
        self
    }

    fn transition(
        &mut self,
        allowed: &[ExecutionStatus],
        to: ExecutionStatus,
    ) -> Result<(), TransitionError> {
        if !allowed.contains(&self.status) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration_ms = Some((now - self.started_at.unwrap_or(now)).num_milliseconds());
    }

    /// PENDING -> RUNNING.
    ///
    /// # Errors
    ///
    /// Returns an error from any other state.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(&[ExecutionStatus::Pending], ExecutionStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// RUNNING -> WAITING.
    ///
    /// # Errors
    ///
    /// Returns an error from any other state.
    pub fn wait(&mut self) -> Result<(), TransitionError> {
        self.transition(&[ExecutionStatus::Running], ExecutionStatus::Waiting)
    }

    /// WAITING -> RUNNING.
    ///
    /// # Errors
    ///
    /// Returns an error from any other state.
    pub fn resume(&mut self) -> Result<(), TransitionError> {
        self.transition(&[ExecutionStatus::Waiting], ExecutionStatus::Running)
    }

    /// RUNNING -> SUCCESS, recording the terminal nodes' output.
    ///
    /// # Errors
    ///
    /// Returns an error from any other state.
    pub fn succeed(&mut self, output: JsonValue) -> Result<(), TransitionError> {
        self.transition(&[ExecutionStatus::Running], ExecutionStatus::Success)?;
        self.output_data = Some(output);
        self.finish();
        Ok(())
    }

    /// PENDING/RUNNING/WAITING -> ERROR.
    ///
    /// PENDING is allowed so that planning failures end the execution before
    /// any node runs.
    ///
    /// # Errors
    ///
    /// Returns an error from a terminal state.
    pub fn fail(&mut self, failure: ExecutionFailure) -> Result<(), TransitionError> {
        self.transition(
            &[
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::Waiting,
            ],
            ExecutionStatus::Error,
        )?;
        self.error = Some(failure);
        self.finish();
        Ok(())
    }

    /// PENDING/RUNNING/WAITING -> CANCELLED.
    ///
    /// # Errors
    ///
    /// Returns an error from a terminal state.
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(
            &[
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
                ExecutionStatus::Waiting,
            ],
            ExecutionStatus::Cancelled,
        )?;
        for run in &mut self.node_runs {
            if !run.status.is_terminal() {
                run.cancel();
            }
        }
        self.finish();
        Ok(())
    }

    /// Builds the PENDING execution that retries this one.
    ///
    /// # Errors
    ///
    /// Only ERROR and CANCELLED executions can be retried.
    pub fn new_retry(&self, triggered_by: Option<UserId>) -> Result<Self, TransitionError> {
        if !matches!(
            self.status,
            ExecutionStatus::Error | ExecutionStatus::Cancelled
        ) {
            return Err(TransitionError {
                from: self.status,
                to: ExecutionStatus::Pending,
            });
        }

        let mut retry = Self::new(
            self.workflow_id,
            self.workflow_version,
            self.mode,
            self.input_data.clone(),
        );
        retry.triggered_by = triggered_by.or(self.triggered_by);
        retry.fired_trigger = self.fired_trigger.clone();
        retry.retry_count = self.retry_count + 1;
        retry.retry_of = Some(self.id);
        Ok(retry)
    }

    /// Returns the elapsed time, or time so far if still running.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some(end - start)
    }

    /// Returns the record for a node, if it was reached.
    #[must_use]
    pub fn node_run(&self, node_id: &NodeId) -> Option<&NodeRun> {
        self.node_runs.iter().find(|run| &run.node_id == node_id)
    }

    /// Inserts or replaces the record for `run.node_id`.
    pub fn record_node_run(&mut self, run: NodeRun) {
        match self
            .node_runs
            .iter_mut()
            .find(|existing| existing.node_id == run.node_id)
        {
            Some(existing) => *existing = run,
            None => self.node_runs.push(run),
        }
    }

    /// Number of node runs whose executor was actually called.
    #[must_use]
    pub fn invoked_count(&self) -> usize {
        self.node_runs.iter().filter(|run| run.invoked).count()
    }
}

/// A read-only projection for listing pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub retry_count: u32,
    pub error: Option<String>,
}

impl From<&Execution> for ExecutionSummary {
    fn from(execution: &Execution) -> Self {
        Self {
            id: execution.id,
            workflow_id: execution.workflow_id,
            mode: execution.mode,
            status: execution.status,
            started_at: execution.started_at,
            finished_at: execution.finished_at,
            duration_ms: execution.duration_ms,
            retry_count: execution.retry_count,
            error: execution.error.as_ref().map(ToString::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeErrorKind;
    use serde_json::json;

    fn pending() -> Execution {
        Execution::new(WorkflowId::new(), 1, ExecutionMode::Manual, json!({ "a": 1 }))
    }

    #[test]
    fn status_terminal() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Waiting.is_terminal());
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Error.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Waiting,
            ExecutionStatus::Success,
            ExecutionStatus::Error,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>(), Ok(status));
        }
        assert!("DONE".parse::<ExecutionStatus>().is_err());
        assert_eq!(
            serde_json::to_value(ExecutionMode::Schedule).expect("serialize"),
            json!("SCHEDULE")
        );
    }

    #[test]
    fn successful_lifecycle() {
        let mut execution = pending();
        execution.start().expect("start");
        assert!(execution.started_at.is_some());
        execution.wait().expect("wait");
        execution.resume().expect("resume");
        execution.succeed(json!({ "ok": true })).expect("succeed");

        assert_eq!(execution.status, ExecutionStatus::Success);
        assert!(execution.finished_at.is_some());
        assert!(execution.duration_ms.is_some_and(|ms| ms >= 0));
        assert_eq!(execution.output_data, Some(json!({ "ok": true })));
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let mut execution = pending();
        execution.start().expect("start");
        execution.succeed(JsonValue::Null).expect("succeed");

        let err = execution.start().unwrap_err();
        assert_eq!(err.from, ExecutionStatus::Success);
        assert!(execution.cancel().is_err());
        assert!(execution.fail(ExecutionFailure::planning("x")).is_err());
    }

    #[test]
    fn pending_can_fail_directly() {
        let mut execution = pending();
        execution
            .fail(ExecutionFailure::planning("cycle detected"))
            .expect("fail");
        assert_eq!(execution.status, ExecutionStatus::Error);
        assert_eq!(execution.duration_ms, Some(0));
    }

    #[test]
    fn cancel_marks_in_flight_node_runs() {
        let mut execution = pending();
        execution.start().expect("start");
        execution.record_node_run(NodeRun::started(NodeId::from("a"), "wait", json!({})));
        execution.wait().expect("wait");
        execution.cancel().expect("cancel");

        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        let run = execution.node_run(&NodeId::from("a")).expect("run");
        assert_eq!(run.status, NodeRunStatus::Cancelled);
    }

    #[test]
    fn retry_creates_linked_pending_execution() {
        let mut original = pending();
        original.start().expect("start");
        let err = NodeError::new(NodeId::from("h"), NodeErrorKind::UpstreamServiceError, "502");
        original.fail(ExecutionFailure::from(&err)).expect("fail");
        let snapshot = original.clone();

        let retry = original.new_retry(None).expect("retry");

        assert_eq!(retry.status, ExecutionStatus::Pending);
        assert_eq!(retry.retry_of, Some(original.id));
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.input_data, original.input_data);
        assert_ne!(retry.id, original.id);
        assert_eq!(original, snapshot);
    }

    #[test]
    fn retrying_success_is_rejected() {
        let mut execution = pending();
        execution.start().expect("start");
        execution.succeed(JsonValue::Null).expect("succeed");
        assert!(execution.new_retry(None).is_err());
    }

    #[test]
    fn record_node_run_replaces_by_node() {
        let mut execution = pending();
        let mut run = NodeRun::started(NodeId::from("a"), "set", json!({}));
        execution.record_node_run(run.clone());
        run.succeed(json!(1), None);
        execution.record_node_run(run);
        execution.record_node_run(NodeRun::skipped(NodeId::from("b"), "set"));

        assert_eq!(execution.node_runs.len(), 2);
        assert_eq!(
            execution.node_run(&NodeId::from("a")).map(|r| r.status),
            Some(NodeRunStatus::Success)
        );
        assert_eq!(execution.invoked_count(), 1);
    }

    #[test]
    fn failure_display_names_node() {
        let failure = ExecutionFailure::node(NodeId::from("fetch"), "timed out");
        assert_eq!(failure.to_string(), "node fetch: timed out");
        let summary = ExecutionSummary::from(&pending());
        assert_eq!(summary.status, ExecutionStatus::Pending);
    }
}
