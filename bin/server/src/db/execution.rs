//! Execution records.
//!
//! Node runs, input, output and failure are stored as JSONB on the execution
//! row; the row is always rewritten whole by the runner that owns it.

use super::{backend, decode, decode_json, decode_u32, encode_json, is_unique_violation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowforge_core::{ExecutionId, Result, WorkflowId};
use flowforge_engine::{ExecutionStore, StoreError};
use flowforge_workflow::{Execution, ExecutionStatus, NodeId};
use sqlx::{FromRow, PgPool, Postgres};
use tracing::{debug, instrument};

/// Row type for execution queries.
#[derive(FromRow)]
struct ExecutionRow {
    id: String,
    workflow_id: String,
    workflow_version: i64,
    triggered_by: Option<String>,
    mode: String,
    status: String,
    fired_trigger: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    input_data: serde_json::Value,
    output_data: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
    retry_count: i64,
    retry_of: Option<String>,
    node_runs: serde_json::Value,
}

impl ExecutionRow {
    fn try_into_execution(self) -> std::result::Result<Execution, sqlx::Error> {
        Ok(Execution {
            id: decode("execution id", &self.id)?,
            workflow_id: decode("workflow id", &self.workflow_id)?,
            workflow_version: decode_u32("workflow version", self.workflow_version)?,
            triggered_by: self
                .triggered_by
                .as_deref()
                .map(|raw| decode("user id", raw))
                .transpose()?,
            mode: decode("execution mode", &self.mode)?,
            status: decode("execution status", &self.status)?,
            fired_trigger: self.fired_trigger.map(NodeId::new),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms: self.duration_ms,
            input_data: self.input_data,
            output_data: self.output_data,
            error: self.error.map(|e| decode_json("failure", e)).transpose()?,
            retry_count: decode_u32("retry count", self.retry_count)?,
            retry_of: self
                .retry_of
                .as_deref()
                .map(|raw| decode("execution id", raw))
                .transpose()?,
            node_runs: decode_json("node runs", self.node_runs)?,
        })
    }
}

const EXECUTION_COLUMNS: &str = "id, workflow_id, workflow_version, triggered_by, mode, status, \
     fired_trigger, created_at, started_at, finished_at, duration_ms, input_data, output_data, \
     error, retry_count, retry_of, node_runs";

/// Repository for execution records.
#[derive(Clone)]
pub struct PgExecutionStore {
    pool: PgPool,
}

impl PgExecutionStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch<'e, E>(executor: E, id: ExecutionId, lock: bool) -> Result<Execution, StoreError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let suffix = if lock { " FOR UPDATE" } else { "" };
        let row: Option<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1{suffix}"
        ))
        .bind(id.to_string())
        .fetch_optional(executor)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => Ok(row.try_into_execution().map_err(backend)?),
            None => Err(StoreError::execution_not_found(id).into()),
        }
    }

    /// Rewrites every mutable column of `execution`, optionally only while
    /// the stored status is `expected`. Returns the number of rows written.
    async fn write<'e, E>(
        executor: E,
        execution: &Execution,
        expected: Option<ExecutionStatus>,
    ) -> Result<u64, StoreError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = $2, started_at = $3, finished_at = $4, duration_ms = $5,
                output_data = $6, error = $7, node_runs = $8
            WHERE id = $1 AND ($9::TEXT IS NULL OR status = $9)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.status.as_str())
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(execution.duration_ms)
        .bind(&execution.output_data)
        .bind(execution.error.as_ref().map(encode_json).transpose()?)
        .bind(encode_json(&execution.node_runs)?)
        .bind(expected.map(|status| status.as_str()))
        .execute(executor)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    async fn insert(&self, execution: &Execution) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO executions (id, workflow_id, workflow_version, triggered_by, mode, status,
                                    fired_trigger, created_at, started_at, finished_at, duration_ms,
                                    input_data, output_data, error, retry_count, retry_of, node_runs)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.workflow_id.to_string())
        .bind(i64::from(execution.workflow_version))
        .bind(execution.triggered_by.map(|id| id.to_string()))
        .bind(execution.mode.as_str())
        .bind(execution.status.as_str())
        .bind(execution.fired_trigger.as_ref().map(NodeId::as_str))
        .bind(execution.created_at)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(execution.duration_ms)
        .bind(&execution.input_data)
        .bind(&execution.output_data)
        .bind(execution.error.as_ref().map(encode_json).transpose()?)
        .bind(i64::from(execution.retry_count))
        .bind(execution.retry_of.map(|id| id.to_string()))
        .bind(encode_json(&execution.node_runs)?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyExists {
                entity: "execution",
                id: execution.id.to_string(),
            }
            .into()),
            Err(e) => Err(backend(e).into()),
        }
    }

    async fn get(&self, id: ExecutionId) -> Result<Execution, StoreError> {
        Self::fetch(&self.pool, id, false).await
    }

    #[instrument(skip(self), fields(execution_id = %id))]
    async fn try_start(&self, id: ExecutionId) -> Result<Option<Execution>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let mut execution = Self::fetch(&mut *tx, id, true).await?;
        if execution.start().is_err() {
            debug!(status = %execution.status, "execution not pending, not started");
            return Ok(None);
        }
        Self::write(&mut *tx, &execution, Some(ExecutionStatus::Pending)).await?;
        tx.commit().await.map_err(backend)?;
        Ok(Some(execution))
    }

    async fn update_if(
        &self,
        expected: ExecutionStatus,
        execution: &Execution,
    ) -> Result<bool, StoreError> {
        if Self::write(&self.pool, execution, Some(expected)).await? > 0 {
            return Ok(true);
        }
        // Distinguish a lost race from a missing record.
        Self::fetch(&self.pool, execution.id, false).await?;
        Ok(false)
    }

    async fn list_for_workflow(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<Vec<Execution>, StoreError> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE workflow_id = $1 \
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| row.try_into_execution().map_err(|e| backend(e).into()))
            .collect()
    }

    async fn delete(&self, id: ExecutionId) -> Result<(), StoreError> {
        let deleted = sqlx::query("DELETE FROM executions WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::execution_not_found(id).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_core::UserId;
    use flowforge_workflow::{ExecutionFailure, ExecutionMode};
    use serde_json::json;

    fn row_for(execution: &Execution) -> ExecutionRow {
        ExecutionRow {
            id: execution.id.to_string(),
            workflow_id: execution.workflow_id.to_string(),
            workflow_version: i64::from(execution.workflow_version),
            triggered_by: execution.triggered_by.map(|id| id.to_string()),
            mode: execution.mode.as_str().to_string(),
            status: execution.status.as_str().to_string(),
            fired_trigger: execution.fired_trigger.as_ref().map(ToString::to_string),
            created_at: execution.created_at,
            started_at: execution.started_at,
            finished_at: execution.finished_at,
            duration_ms: execution.duration_ms,
            input_data: execution.input_data.clone(),
            output_data: execution.output_data.clone(),
            error: execution
                .error
                .as_ref()
                .map(|e| serde_json::to_value(e).expect("failure")),
            retry_count: i64::from(execution.retry_count),
            retry_of: execution.retry_of.map(|id| id.to_string()),
            node_runs: serde_json::to_value(&execution.node_runs).expect("node runs"),
        }
    }

    #[test]
    fn row_converts_back_to_the_execution() {
        let mut execution = Execution::new(
            WorkflowId::new(),
            4,
            ExecutionMode::Webhook,
            json!({ "order": 17 }),
        )
        .triggered_by(UserId::new())
        .with_fired_trigger(NodeId::new("hook"));
        execution.start().expect("start");
        execution.error = Some(ExecutionFailure::planning("cycle detected"));

        let restored = row_for(&execution).try_into_execution().expect("convert");
        assert_eq!(restored, execution);
    }

    #[test]
    fn unknown_status_is_a_decode_error() {
        let execution = Execution::new(WorkflowId::new(), 1, ExecutionMode::Manual, json!({}));
        let mut row = row_for(&execution);
        row.status = "PAUSED".to_string();
        assert!(matches!(row.try_into_execution(), Err(sqlx::Error::Decode(_))));
    }
}
