//! Persistence seams for workflows and executions.
//!
//! The runner is the only writer of an execution's progress, and every
//! write is conditional on the status it last saw. That is what keeps two
//! runners (or a runner and a user cancellation) from clobbering each other.

use crate::error::StoreError;
use async_trait::async_trait;
use flowforge_core::{ExecutionId, Result, WorkflowId};
use flowforge_workflow::{Execution, ExecutionStatus, Workflow, WorkflowVersion};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Storage for execution records.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Inserts a new execution.
    async fn insert(&self, execution: &Execution) -> Result<(), StoreError>;

    async fn get(&self, id: ExecutionId) -> Result<Execution, StoreError>;

    /// Atomically moves a PENDING execution to RUNNING.
    ///
    /// Returns the started record, or `None` if the execution was in any
    /// other state. Only one caller can ever win for a given id.
    async fn try_start(&self, id: ExecutionId) -> Result<Option<Execution>, StoreError>;

    /// Overwrites the record if its stored status is still `expected`.
    ///
    /// Returns false, writing nothing, if the stored status differs.
    async fn update_if(
        &self,
        expected: ExecutionStatus,
        execution: &Execution,
    ) -> Result<bool, StoreError>;

    /// Executions of a workflow, newest first.
    async fn list_for_workflow(&self, workflow_id: WorkflowId)
    -> Result<Vec<Execution>, StoreError>;

    async fn delete(&self, id: ExecutionId) -> Result<(), StoreError>;
}

/// Storage for workflow definitions and their version snapshots.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn get(&self, id: WorkflowId) -> Result<Workflow, StoreError>;

    async fn create(&self, workflow: &Workflow) -> Result<(), StoreError>;

    /// Saves `workflow` together with the snapshot of the graph it replaced.
    ///
    /// The stored version must equal `snapshot.version_num`, otherwise the
    /// save lost a race and [`StoreError::VersionConflict`] is returned.
    async fn update(&self, workflow: &Workflow, snapshot: &WorkflowVersion)
    -> Result<(), StoreError>;

    /// Updates fields that do not touch the graph (name, activation, alerts).
    async fn update_metadata(&self, workflow: &Workflow) -> Result<(), StoreError>;

    /// Active workflows, for the schedule dispatcher.
    async fn list_active(&self) -> Result<Vec<Workflow>, StoreError>;

    /// Snapshots of a workflow in ascending `version_num` order.
    async fn versions(&self, workflow_id: WorkflowId) -> Result<Vec<WorkflowVersion>, StoreError>;

    async fn version(
        &self,
        workflow_id: WorkflowId,
        version_num: u32,
    ) -> Result<Option<WorkflowVersion>, StoreError>;
}

/// In-memory execution store.
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    executions: RwLock<HashMap<ExecutionId, Execution>>,
}

impl MemoryExecutionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn insert(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.id) {
            return Err(StoreError::AlreadyExists {
                entity: "execution",
                id: execution.id.to_string(),
            }
            .into());
        }
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get(&self, id: ExecutionId) -> Result<Execution, StoreError> {
        let executions = self.executions.read().await;
        executions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::execution_not_found(id).into())
    }

    #[instrument(skip(self), fields(execution_id = %id))]
    async fn try_start(&self, id: ExecutionId) -> Result<Option<Execution>, StoreError> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::execution_not_found(id))?;
        if execution.start().is_err() {
            debug!(status = %execution.status, "execution not pending, not started");
            return Ok(None);
        }
        Ok(Some(execution.clone()))
    }

    async fn update_if(
        &self,
        expected: ExecutionStatus,
        execution: &Execution,
    ) -> Result<bool, StoreError> {
        let mut executions = self.executions.write().await;
        let stored = executions
            .get_mut(&execution.id)
            .ok_or_else(|| StoreError::execution_not_found(execution.id))?;
        if stored.status != expected {
            return Ok(false);
        }
        *stored = execution.clone();
        Ok(true)
    }

    async fn list_for_workflow(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<Vec<Execution>, StoreError> {
        let executions = self.executions.read().await;
        let mut matching: Vec<Execution> = executions
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(matching)
    }

    async fn delete(&self, id: ExecutionId) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        executions
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::execution_not_found(id).into())
    }
}

/// In-memory workflow store.
#[derive(Debug, Default)]
pub struct MemoryWorkflowStore {
    workflows: RwLock<HashMap<WorkflowId, Workflow>>,
    versions: RwLock<HashMap<WorkflowId, Vec<WorkflowVersion>>>,
}

impl MemoryWorkflowStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn get(&self, id: WorkflowId) -> Result<Workflow, StoreError> {
        let workflows = self.workflows.read().await;
        workflows
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::workflow_not_found(id).into())
    }

    async fn create(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&workflow.id) {
            return Err(StoreError::AlreadyExists {
                entity: "workflow",
                id: workflow.id.to_string(),
            }
            .into());
        }
        workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    #[instrument(skip(self, workflow, snapshot), fields(workflow_id = %workflow.id, version = workflow.version))]
    async fn update(
        &self,
        workflow: &Workflow,
        snapshot: &WorkflowVersion,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write().await;
        let stored = workflows
            .get_mut(&workflow.id)
            .ok_or_else(|| StoreError::workflow_not_found(workflow.id))?;
        if stored.version != snapshot.version_num {
            return Err(StoreError::VersionConflict {
                expected: snapshot.version_num,
                actual: stored.version,
            }
            .into());
        }
        *stored = workflow.clone();
        self.versions
            .write()
            .await
            .entry(workflow.id)
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn update_metadata(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write().await;
        let stored = workflows
            .get_mut(&workflow.id)
            .ok_or_else(|| StoreError::workflow_not_found(workflow.id))?;
        stored.name.clone_from(&workflow.name);
        stored.description.clone_from(&workflow.description);
        stored.is_active = workflow.is_active;
        stored.error_alerts = workflow.error_alerts.clone();
        stored.updated_at = workflow.updated_at;
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Workflow>, StoreError> {
        let workflows = self.workflows.read().await;
        let mut active: Vec<Workflow> = workflows.values().filter(|w| w.is_active).cloned().collect();
        active.sort_by_key(|w| w.id);
        Ok(active)
    }

    async fn versions(&self, workflow_id: WorkflowId) -> Result<Vec<WorkflowVersion>, StoreError> {
        let versions = self.versions.read().await;
        Ok(versions.get(&workflow_id).cloned().unwrap_or_default())
    }

    async fn version(
        &self,
        workflow_id: WorkflowId,
        version_num: u32,
    ) -> Result<Option<WorkflowVersion>, StoreError> {
        let versions = self.versions.read().await;
        Ok(versions
            .get(&workflow_id)
            .and_then(|all| all.iter().find(|v| v.version_num == version_num))
            .cloned())
    }
}
