//! Error types for the engine crate.
//!
//! - `StoreError`: a repository could not read or write a record
//! - `EngineError`: why an engine API call could not be carried out
//!
//! Neither describes a workflow that *ran* and failed: that outcome is an
//! ERROR execution record, not an error value.

use flowforge_core::{ExecutionId, WorkflowId};
use flowforge_workflow::{ExecutionStatus, TransitionError, VersionError};
use std::fmt;

/// Errors from execution and workflow repositories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No record with this id.
    NotFound { entity: &'static str, id: String },
    /// A record with this id already exists.
    AlreadyExists { entity: &'static str, id: String },
    /// Optimistic concurrency check failed.
    VersionConflict { expected: u32, actual: u32 },
    /// The backing store failed.
    Backend { reason: String },
}

impl StoreError {
    #[must_use]
    pub fn workflow_not_found(id: WorkflowId) -> Self {
        Self::NotFound {
            entity: "workflow",
            id: id.to_string(),
        }
    }

    #[must_use]
    pub fn execution_not_found(id: ExecutionId) -> Self {
        Self::NotFound {
            entity: "execution",
            id: id.to_string(),
        }
    }

    #[must_use]
    pub fn backend(reason: impl fmt::Display) -> Self {
        Self::Backend {
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::AlreadyExists { entity, id } => write!(f, "{entity} already exists: {id}"),
            Self::VersionConflict { expected, actual } => {
                write!(f, "version conflict: expected {expected}, found {actual}")
            }
            Self::Backend { reason } => write!(f, "storage operation failed: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from the engine API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    WorkflowNotFound { workflow_id: WorkflowId },
    ExecutionNotFound { execution_id: ExecutionId },
    /// No webhook trigger in the workflow matches the request path.
    WebhookNotFound { workflow_id: WorkflowId, path: String },
    /// Schedule and webhook triggers do not fire for inactive workflows.
    WorkflowInactive { workflow_id: WorkflowId },
    /// The execution's current state does not allow the operation.
    InvalidTransition(TransitionError),
    /// Deleting a record that a runner still owns.
    ExecutionActive {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },
    Version(VersionError),
    /// Someone saved the workflow in the meantime.
    Conflict { reason: String },
    /// Persisting or loading state failed.
    Persistence { reason: String },
    /// The engine could not be assembled.
    Setup { reason: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowNotFound { workflow_id } => {
                write!(f, "workflow not found: {workflow_id}")
            }
            Self::ExecutionNotFound { execution_id } => {
                write!(f, "execution not found: {execution_id}")
            }
            Self::WebhookNotFound { workflow_id, path } => {
                write!(f, "no webhook trigger for '{path}' in workflow {workflow_id}")
            }
            Self::WorkflowInactive { workflow_id } => {
                write!(f, "workflow {workflow_id} is inactive")
            }
            Self::InvalidTransition(e) => write!(f, "{e}"),
            Self::ExecutionActive {
                execution_id,
                status,
            } => write!(f, "execution {execution_id} is still {status}"),
            Self::Version(e) => write!(f, "{e}"),
            Self::Conflict { reason } => write!(f, "conflict: {reason}"),
            Self::Persistence { reason } => write!(f, "persistence failed: {reason}"),
            Self::Setup { reason } => write!(f, "engine setup failed: {reason}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<TransitionError> for EngineError {
    fn from(e: TransitionError) -> Self {
        Self::InvalidTransition(e)
    }
}

impl From<VersionError> for EngineError {
    fn from(e: VersionError) -> Self {
        Self::Version(e)
    }
}

impl From<&StoreError> for EngineError {
    fn from(e: &StoreError) -> Self {
        match e {
            StoreError::VersionConflict { .. } | StoreError::AlreadyExists { .. } => {
                Self::Conflict {
                    reason: e.to_string(),
                }
            }
            StoreError::NotFound { .. } | StoreError::Backend { .. } => Self::Persistence {
                reason: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display() {
        let id = WorkflowId::new();
        let err = StoreError::workflow_not_found(id);
        assert!(err.to_string().contains("workflow not found"));
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn conflicts_stay_distinct_from_persistence_failures() {
        let conflict = StoreError::VersionConflict {
            expected: 2,
            actual: 3,
        };
        assert!(matches!(
            EngineError::from(&conflict),
            EngineError::Conflict { .. }
        ));
        assert!(matches!(
            EngineError::from(&StoreError::backend("disk full")),
            EngineError::Persistence { .. }
        ));
    }

    #[test]
    fn transition_error_converts() {
        let err: EngineError = TransitionError {
            from: ExecutionStatus::Success,
            to: ExecutionStatus::Pending,
        }
        .into();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
    }
}
