//! Postgres persistence for the flowforge server.
//!
//! This module provides:
//! - Workflow definitions and their version snapshots
//! - Execution records, with the conditional writes the runner relies on
//! - Sealed credentials
//! - The driver behind `database` nodes

pub mod credential;
pub mod execution;
pub mod query;
pub mod workflow;

pub use credential::PgCredentialVault;
pub use execution::PgExecutionStore;
pub use query::PgDatabaseClient;
pub use workflow::PgWorkflowStore;

use flowforge_engine::StoreError;
use std::fmt::Display;
use std::str::FromStr;

/// Parses a column holding an id or enum name.
fn decode<T>(kind: &str, raw: &str) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: Display,
{
    T::from_str(raw).map_err(|e| {
        sqlx::Error::Decode(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid {kind} '{raw}': {e}"),
        )))
    })
}

/// Reads a JSON column into a typed value.
fn decode_json<T: serde::de::DeserializeOwned>(
    kind: &str,
    value: serde_json::Value,
) -> Result<T, sqlx::Error> {
    serde_json::from_value(value).map_err(|e| {
        sqlx::Error::Decode(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid {kind}: {e}"),
        )))
    })
}

/// Narrows a BIGINT counter column.
fn decode_u32(kind: &str, raw: i64) -> Result<u32, sqlx::Error> {
    u32::try_from(raw).map_err(|e| {
        sqlx::Error::Decode(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid {kind} {raw}: {e}"),
        )))
    })
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(StoreError::backend)
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::backend(e)
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}
