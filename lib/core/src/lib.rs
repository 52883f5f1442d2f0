//! Core domain types and utilities for the flowforge workflow engine.
//!
//! This crate provides the strongly-typed identifiers and the error
//! handling foundation shared by every other flowforge crate.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{
    CredentialId, ExecutionId, NodeRunId, ParseIdError, TypedId, UserId, WorkflowId,
    WorkflowVersionId,
};
