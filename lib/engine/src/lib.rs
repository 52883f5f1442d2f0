//! Workflow execution for flowforge.
//!
//! - **Executors**: the [`NodeExecutor`] seam and the built-in node kinds
//! - **Runner**: drives one execution level by level, with retries,
//!   timeouts, cancellation and WAITING transitions
//! - **Engine**: the facade that creates, runs, cancels and retries
//!   executions and saves workflow versions
//! - **Stores**: persistence seams with in-memory implementations
//! - **Alerts**: failure notices for workflows that ask for them

pub mod alert;
pub mod config;
pub mod error;
pub mod executor;
pub mod nodes;
mod runner;
pub mod service;
pub mod store;

pub use alert::{AlertSink, ErrorAlert, WebhookAlertSink};
pub use config::EngineConfig;
pub use error::{EngineError, StoreError};
pub use executor::{
    ChildRun, DatabaseClient, ExecutorRegistry, NoDatabase, NodeContext, NodeExecutor, Services,
    SubWorkflowLauncher,
};
pub use service::{Engine, EngineBuilder, ExecutionRequest, WorkflowDraft};
pub use store::{ExecutionStore, MemoryExecutionStore, MemoryWorkflowStore, WorkflowStore};
