//! Error types for the integration crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `ConnectorError`: failures talking to an external service
//! - `CredentialError`: failures storing, loading or decrypting credentials

use flowforge_core::CredentialId;
use std::fmt;

/// Errors from outbound calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// Connection to the service failed.
    ConnectionFailed { reason: String },
    /// The service rejected the credentials.
    AuthenticationFailed { reason: String },
    /// Rate limit exceeded, locally or remotely.
    RateLimited { retry_after_secs: Option<u64> },
    /// The request could not be built from the given parameters.
    InvalidParameters { operation: String, reason: String },
    /// The service answered with a non-success status.
    UpstreamStatus { status: u16, body: String },
    /// The response could not be understood.
    ProtocolError { reason: String },
    /// No response in time.
    Timeout,
}

impl ConnectorError {
    /// Whether the call may succeed if repeated.
    ///
    /// Timeouts, connection failures, rate limits and 5xx answers are
    /// transient; everything else is not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } | Self::RateLimited { .. } | Self::Timeout => true,
            Self::UpstreamStatus { status, .. } => *status >= 500,
            Self::AuthenticationFailed { .. }
            | Self::InvalidParameters { .. }
            | Self::ProtocolError { .. } => false,
        }
    }
}

impl fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { reason } => {
                write!(f, "connection failed: {reason}")
            }
            Self::AuthenticationFailed { reason } => {
                write!(f, "authentication failed: {reason}")
            }
            Self::RateLimited { retry_after_secs } => {
                if let Some(secs) = retry_after_secs {
                    write!(f, "rate limited, retry after {secs}s")
                } else {
                    write!(f, "rate limited")
                }
            }
            Self::InvalidParameters { operation, reason } => {
                write!(f, "invalid parameters for '{operation}': {reason}")
            }
            Self::UpstreamStatus { status, body } => {
                write!(f, "upstream returned {status}: {body}")
            }
            Self::ProtocolError { reason } => {
                write!(f, "protocol error: {reason}")
            }
            Self::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl std::error::Error for ConnectorError {}

/// Errors from credential operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// No credential with this id.
    NotFound { id: String },
    /// The master key is not a base64-encoded 32-byte key.
    InvalidKey { reason: String },
    /// Encryption failed.
    EncryptionFailed { reason: String },
    /// Decryption failed: wrong key or tampered ciphertext.
    DecryptionFailed { id: Option<CredentialId> },
    /// Decrypted data is not a valid credential payload.
    InvalidFormat { reason: String },
    /// The backing store failed.
    StorageFailed { reason: String },
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => {
                write!(f, "credential not found: {id}")
            }
            Self::InvalidKey { reason } => {
                write!(f, "invalid credential key: {reason}")
            }
            Self::EncryptionFailed { reason } => {
                write!(f, "encryption failed: {reason}")
            }
            Self::DecryptionFailed { id: Some(id) } => {
                write!(f, "decryption failed for {id}")
            }
            Self::DecryptionFailed { id: None } => write!(f, "decryption failed"),
            Self::InvalidFormat { reason } => {
                write!(f, "invalid credential format: {reason}")
            }
            Self::StorageFailed { reason } => {
                write!(f, "storage operation failed: {reason}")
            }
        }
    }
}

impl std::error::Error for CredentialError {}
