//! Workflow definitions and their version snapshots.

use super::{backend, decode, decode_json, decode_u32, encode_json, is_unique_violation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowforge_core::{Result, WorkflowId};
use flowforge_engine::{StoreError, WorkflowStore};
use flowforge_workflow::{Workflow, WorkflowVersion};
use sqlx::{FromRow, PgPool};
use tracing::{debug, instrument};

/// Row type for workflow queries.
#[derive(FromRow)]
struct WorkflowRow {
    id: String,
    owner_id: String,
    name: String,
    description: Option<String>,
    nodes: serde_json::Value,
    edges: serde_json::Value,
    version: i64,
    is_active: bool,
    error_alerts: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkflowRow {
    fn try_into_workflow(self) -> std::result::Result<Workflow, sqlx::Error> {
        Ok(Workflow {
            id: decode("workflow id", &self.id)?,
            owner_id: decode("user id", &self.owner_id)?,
            name: self.name,
            description: self.description,
            nodes: decode_json("nodes", self.nodes)?,
            edges: decode_json("edges", self.edges)?,
            version: decode_u32("version", self.version)?,
            is_active: self.is_active,
            error_alerts: decode_json("error alerts", self.error_alerts)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Row type for version snapshot queries.
#[derive(FromRow)]
struct VersionRow {
    id: String,
    workflow_id: String,
    version_num: i64,
    nodes: serde_json::Value,
    edges: serde_json::Value,
    created_by: Option<String>,
    created_at: DateTime<Utc>,
}

impl VersionRow {
    fn try_into_version(self) -> std::result::Result<WorkflowVersion, sqlx::Error> {
        Ok(WorkflowVersion {
            id: decode("version id", &self.id)?,
            workflow_id: decode("workflow id", &self.workflow_id)?,
            version_num: decode_u32("version number", self.version_num)?,
            nodes: decode_json("nodes", self.nodes)?,
            edges: decode_json("edges", self.edges)?,
            created_by: self
                .created_by
                .as_deref()
                .map(|raw| decode("user id", raw))
                .transpose()?,
            created_at: self.created_at,
        })
    }
}

const WORKFLOW_COLUMNS: &str = "id, owner_id, name, description, nodes, edges, version, \
     is_active, error_alerts, created_at, updated_at";

const VERSION_COLUMNS: &str = "id, workflow_id, version_num, nodes, edges, created_by, created_at";

/// Repository for workflow definitions.
#[derive(Clone)]
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn get(&self, id: WorkflowId) -> Result<Workflow, StoreError> {
        let row: Option<WorkflowRow> = sqlx::query_as(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => Ok(row.try_into_workflow().map_err(backend)?),
            None => Err(StoreError::workflow_not_found(id).into()),
        }
    }

    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    async fn create(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflows (id, owner_id, name, description, nodes, edges, version,
                                   is_active, error_alerts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(workflow.id.to_string())
        .bind(workflow.owner_id.to_string())
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(encode_json(&workflow.nodes)?)
        .bind(encode_json(&workflow.edges)?)
        .bind(i64::from(workflow.version))
        .bind(workflow.is_active)
        .bind(encode_json(&workflow.error_alerts)?)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!("workflow created");
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyExists {
                entity: "workflow",
                id: workflow.id.to_string(),
            }
            .into()),
            Err(e) => Err(backend(e).into()),
        }
    }

    #[instrument(skip(self, workflow, snapshot), fields(workflow_id = %workflow.id, version = workflow.version))]
    async fn update(
        &self,
        workflow: &Workflow,
        snapshot: &WorkflowVersion,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let updated = sqlx::query(
            r#"
            UPDATE workflows
            SET name = $3, description = $4, nodes = $5, edges = $6, version = $7,
                is_active = $8, error_alerts = $9, updated_at = $10
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(workflow.id.to_string())
        .bind(i64::from(snapshot.version_num))
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(encode_json(&workflow.nodes)?)
        .bind(encode_json(&workflow.edges)?)
        .bind(i64::from(workflow.version))
        .bind(workflow.is_active)
        .bind(encode_json(&workflow.error_alerts)?)
        .bind(workflow.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        if updated.rows_affected() == 0 {
            let actual: Option<i64> = sqlx::query_scalar("SELECT version FROM workflows WHERE id = $1")
                .bind(workflow.id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(backend)?;
            return match actual {
                None => Err(StoreError::workflow_not_found(workflow.id).into()),
                Some(actual) => Err(StoreError::VersionConflict {
                    expected: snapshot.version_num,
                    actual: decode_u32("version", actual).map_err(backend)?,
                }
                .into()),
            };
        }

        sqlx::query(
            r#"
            INSERT INTO workflow_versions (id, workflow_id, version_num, nodes, edges, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(snapshot.id.to_string())
        .bind(snapshot.workflow_id.to_string())
        .bind(i64::from(snapshot.version_num))
        .bind(encode_json(&snapshot.nodes)?)
        .bind(encode_json(&snapshot.edges)?)
        .bind(snapshot.created_by.map(|id| id.to_string()))
        .bind(snapshot.created_at)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        debug!(snapshot = snapshot.version_num, "workflow saved");
        Ok(())
    }

    async fn update_metadata(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE workflows
            SET name = $2, description = $3, is_active = $4, error_alerts = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.is_active)
        .bind(encode_json(&workflow.error_alerts)?)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::workflow_not_found(workflow.id).into());
        }
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Workflow>, StoreError> {
        let rows: Vec<WorkflowRow> = sqlx::query_as(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE is_active ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| row.try_into_workflow().map_err(|e| backend(e).into()))
            .collect()
    }

    async fn versions(&self, workflow_id: WorkflowId) -> Result<Vec<WorkflowVersion>, StoreError> {
        let rows: Vec<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM workflow_versions WHERE workflow_id = $1 ORDER BY version_num"
        ))
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| row.try_into_version().map_err(|e| backend(e).into()))
            .collect()
    }

    async fn version(
        &self,
        workflow_id: WorkflowId,
        version_num: u32,
    ) -> Result<Option<WorkflowVersion>, StoreError> {
        let row: Option<VersionRow> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS} FROM workflow_versions WHERE workflow_id = $1 AND version_num = $2"
        ))
        .bind(workflow_id.to_string())
        .bind(i64::from(version_num))
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(VersionRow::try_into_version)
            .transpose()
            .map_err(|e| backend(e).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_core::UserId;
    use flowforge_workflow::{Node, NodeType};
    use serde_json::json;

    fn row_for(workflow: &Workflow) -> WorkflowRow {
        WorkflowRow {
            id: workflow.id.to_string(),
            owner_id: workflow.owner_id.to_string(),
            name: workflow.name.clone(),
            description: workflow.description.clone(),
            nodes: serde_json::to_value(&workflow.nodes).expect("nodes"),
            edges: serde_json::to_value(&workflow.edges).expect("edges"),
            version: i64::from(workflow.version),
            is_active: workflow.is_active,
            error_alerts: serde_json::to_value(&workflow.error_alerts).expect("alerts"),
            created_at: workflow.created_at,
            updated_at: workflow.updated_at,
        }
    }

    #[test]
    fn row_converts_back_to_the_workflow() {
        let workflow = Workflow::new(UserId::new(), "digest")
            .with_description("daily digest")
            .with_graph(
                vec![Node::new("start", NodeType::ManualTrigger, json!({}))],
                vec![],
            );
        let restored = row_for(&workflow).try_into_workflow().expect("convert");
        assert_eq!(restored, workflow);
    }

    #[test]
    fn negative_version_is_a_decode_error() {
        let workflow = Workflow::new(UserId::new(), "broken");
        let mut row = row_for(&workflow);
        row.version = -3;
        assert!(matches!(row.try_into_workflow(), Err(sqlx::Error::Decode(_))));
    }
}
