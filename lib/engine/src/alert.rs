//! Failure notices for workflows with error alerts enabled.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowforge_core::{ExecutionId, Result, WorkflowId};
use flowforge_integration::ConnectorError;
use flowforge_integration::connector::check_status;
use flowforge_workflow::{Execution, ExecutionStatus, NodeId, Workflow};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument};

/// The JSON body POSTed to a workflow's alert webhook.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorAlert {
    pub workflow_id: WorkflowId,
    pub workflow_name: String,
    pub execution_id: ExecutionId,
    pub node_id: Option<NodeId>,
    pub message: String,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<JsonValue>,
}

impl ErrorAlert {
    /// Builds the alert for a failed execution, or `None` if the execution
    /// did not fail.
    #[must_use]
    pub fn for_execution(workflow: &Workflow, execution: &Execution) -> Option<Self> {
        if execution.status != ExecutionStatus::Error {
            return None;
        }
        let (node_id, message) = execution.error.as_ref().map_or_else(
            || (None, "execution failed".to_string()),
            |failure| (failure.node_id.clone(), failure.message.clone()),
        );
        Some(Self {
            workflow_id: workflow.id,
            workflow_name: workflow.name.clone(),
            execution_id: execution.id,
            node_id,
            message,
            finished_at: execution.finished_at,
            input: workflow
                .error_alerts
                .include_input
                .then(|| execution.input_data.clone()),
        })
    }
}

/// Delivers error alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Sends `alert` to `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the alert could not be delivered.
    async fn deliver(&self, target: &str, alert: &ErrorAlert) -> Result<(), ConnectorError>;
}

/// POSTs alerts as JSON.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
}

impl WebhookAlertSink {
    /// Creates a sink whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, ConnectorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConnectorError::ConnectionFailed {
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    #[instrument(skip(self, alert), fields(execution_id = %alert.execution_id))]
    async fn deliver(&self, target: &str, alert: &ErrorAlert) -> Result<(), ConnectorError> {
        let response = self
            .client
            .post(target)
            .json(alert)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ConnectorError::Timeout
                } else {
                    ConnectorError::ConnectionFailed {
                        reason: e.to_string(),
                    }
                }
            })?;
        let status = response.status().as_u16();
        let headers = BTreeMap::new();
        let body = response.text().await.unwrap_or_default();
        check_status(status, &headers, &body)?;
        debug!(status, "alert delivered");
        Ok(())
    }
}
