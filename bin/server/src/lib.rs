//! flowforge HTTP server.
//!
//! This crate wires the engine to its outer surfaces:
//!
//! - **Config**: layered file and environment configuration
//! - **API**: axum routes for workflows, executions, credentials and webhooks
//! - **DB**: Postgres repositories and the `database` node driver

pub mod api;
pub mod config;
pub mod db;
pub mod error;
