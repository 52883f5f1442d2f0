//! Integration layer for flowforge.
//!
//! This crate provides:
//!
//! - **Credentials**: metadata, AES-256-GCM encryption at rest, the vault
//!   trait and the resolver that hands decrypted secrets to nodes
//! - **Connector**: the outbound HTTP boundary every integration node uses
//! - **Providers**: request builders for the hosted services
//! - **Rate limiter**: per-provider sliding-window budgets

pub mod cipher;
pub mod connector;
pub mod credential;
pub mod error;
pub mod providers;
pub mod rate_limit;
pub mod resolver;

pub use cipher::CredentialCipher;
pub use connector::{Auth, Connector, HttpConnector, HttpRequest, HttpResponse, RequestBody};
pub use credential::{
    Credential, CredentialData, CredentialType, CredentialVault, MemoryCredentialVault,
    StoredCredential,
};
pub use error::{ConnectorError, CredentialError};
pub use providers::ProviderEndpoints;
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use resolver::{CredentialProvider, CredentialResolver, ResolvedCredential};
