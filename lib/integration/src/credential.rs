//! Credential vault for secure credential storage.
//!
//! All integration credentials are encrypted at rest.
//! No plaintext credentials are stored in configuration or logs.

use crate::error::CredentialError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowforge_core::{CredentialId, Result, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// The type of credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    /// OAuth 2.0 tokens.
    Oauth2,
    /// API key.
    ApiKey,
    /// Username and password.
    BasicAuth,
    /// Bearer token.
    BearerToken,
    /// Database connection URL.
    ConnectionString,
    /// Custom credential format.
    Custom,
}

impl CredentialType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oauth2 => "oauth2",
            Self::ApiKey => "api_key",
            Self::BasicAuth => "basic_auth",
            Self::BearerToken => "bearer_token",
            Self::ConnectionString => "connection_string",
            Self::Custom => "custom",
        }
    }
}

impl std::str::FromStr for CredentialType {
    type Err = CredentialError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "oauth2" => Ok(Self::Oauth2),
            "api_key" => Ok(Self::ApiKey),
            "basic_auth" => Ok(Self::BasicAuth),
            "bearer_token" => Ok(Self::BearerToken),
            "connection_string" => Ok(Self::ConnectionString),
            "custom" => Ok(Self::Custom),
            other => Err(CredentialError::InvalidFormat {
                reason: format!("unknown credential type '{other}'"),
            }),
        }
    }
}

/// Credential data (encrypted at rest).
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialData {
    /// OAuth 2.0 tokens.
    Oauth2 {
        access_token: String,
        refresh_token: Option<String>,
        token_type: String,
        expires_at: Option<DateTime<Utc>>,
        scope: Option<String>,
    },
    /// API key.
    ApiKey {
        key: String,
        header_name: Option<String>,
    },
    /// Basic authentication.
    BasicAuth { username: String, password: String },
    /// Bearer token.
    BearerToken { token: String },
    /// Database connection URL.
    ConnectionString { url: String },
    /// Custom credential data.
    Custom { data: serde_json::Value },
}

impl std::fmt::Debug for CredentialData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CredentialData::{:?}([redacted])", self.credential_type())
    }
}

impl CredentialData {
    /// Creates OAuth2 credential data.
    #[must_use]
    pub fn oauth2(access_token: impl Into<String>) -> Self {
        Self::Oauth2 {
            access_token: access_token.into(),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            expires_at: None,
            scope: None,
        }
    }

    /// Creates API key credential data.
    #[must_use]
    pub fn api_key(key: impl Into<String>) -> Self {
        Self::ApiKey {
            key: key.into(),
            header_name: None,
        }
    }

    /// Creates basic auth credential data.
    #[must_use]
    pub fn basic_auth(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::BasicAuth {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Returns the credential type.
    #[must_use]
    pub fn credential_type(&self) -> CredentialType {
        match self {
            Self::Oauth2 { .. } => CredentialType::Oauth2,
            Self::ApiKey { .. } => CredentialType::ApiKey,
            Self::BasicAuth { .. } => CredentialType::BasicAuth,
            Self::BearerToken { .. } => CredentialType::BearerToken,
            Self::ConnectionString { .. } => CredentialType::ConnectionString,
            Self::Custom { .. } => CredentialType::Custom,
        }
    }

    /// Checks if OAuth2 credentials need refresh.
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        if let Self::Oauth2 {
            expires_at: Some(expires),
            ..
        } = self
        {
            // Refresh if expiring within 5 minutes
            return *expires < Utc::now() + chrono::Duration::minutes(5);
        }
        false
    }

    /// The secret to send as a bearer token, if this kind has one.
    ///
    /// Custom credentials are searched for `token`, `apiKey` or `key`.
    #[must_use]
    pub fn bearer_secret(&self) -> Option<&str> {
        match self {
            Self::Oauth2 { access_token, .. } => Some(access_token),
            Self::ApiKey { key, .. } => Some(key),
            Self::BearerToken { token } => Some(token),
            Self::Custom { data } => ["token", "apiKey", "key"]
                .iter()
                .find_map(|field| data.get(field).and_then(serde_json::Value::as_str)),
            Self::BasicAuth { .. } | Self::ConnectionString { .. } => None,
        }
    }

    /// A field from a custom credential.
    #[must_use]
    pub fn custom_field(&self, field: &str) -> Option<&str> {
        match self {
            Self::Custom { data } => data.get(field).and_then(serde_json::Value::as_str),
            _ => None,
        }
    }
}

/// Credential metadata. Never carries the secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    /// Unique identifier.
    pub id: CredentialId,
    /// The user who owns this credential.
    pub owner_id: UserId,
    /// Credential name/label.
    pub name: String,
    /// Credential type.
    pub credential_type: CredentialType,
    /// Service this credential is for (`slack`, `github`, ...).
    pub provider: String,
    /// When the credential was created.
    pub created_at: DateTime<Utc>,
    /// When the credential was last updated.
    pub updated_at: DateTime<Utc>,
    /// When the credential was last used.
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Creates a new credential.
    #[must_use]
    pub fn new(
        owner_id: UserId,
        name: impl Into<String>,
        credential_type: CredentialType,
        provider: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: CredentialId::new(),
            owner_id,
            name: name.into(),
            credential_type,
            provider: provider.into(),
            created_at: now,
            updated_at: now,
            last_used_at: None,
        }
    }

    /// Marks the credential as used at `at`, never moving the stamp backwards.
    pub fn mark_used(&mut self, at: DateTime<Utc>) {
        if self.last_used_at.is_none_or(|previous| previous < at) {
            self.last_used_at = Some(at);
        }
    }
}

/// A credential as persisted: metadata plus the encrypted payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCredential {
    pub metadata: Credential,
    pub ciphertext: Vec<u8>,
}

/// Trait for credential storage.
///
/// Implementations only ever see ciphertext.
#[async_trait]
pub trait CredentialVault: Send + Sync {
    /// Stores a credential.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    async fn store(&self, credential: StoredCredential) -> Result<CredentialId, CredentialError>;

    /// Loads a credential with its encrypted payload.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::NotFound`] for unknown ids.
    async fn get(&self, id: CredentialId) -> Result<StoredCredential, CredentialError>;

    /// Records a use. Concurrent calls keep the latest timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::NotFound`] for unknown ids.
    async fn touch(&self, id: CredentialId, at: DateTime<Utc>) -> Result<(), CredentialError>;

    /// Deletes a credential.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::NotFound`] for unknown ids.
    async fn delete(&self, id: CredentialId) -> Result<(), CredentialError>;

    /// Lists credential metadata for a user.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Credential>, CredentialError>;
}

/// In-process vault.
#[derive(Debug, Default)]
pub struct MemoryCredentialVault {
    entries: RwLock<HashMap<CredentialId, StoredCredential>>,
}

impl MemoryCredentialVault {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(id: CredentialId) -> CredentialError {
    CredentialError::NotFound { id: id.to_string() }
}

#[async_trait]
impl CredentialVault for MemoryCredentialVault {
    #[instrument(skip(self, credential), fields(credential_id = %credential.metadata.id))]
    async fn store(&self, credential: StoredCredential) -> Result<CredentialId, CredentialError> {
        let id = credential.metadata.id;
        self.entries.write().await.insert(id, credential);
        debug!("credential stored");
        Ok(id)
    }

    async fn get(&self, id: CredentialId) -> Result<StoredCredential, CredentialError> {
        self.entries
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(id).into())
    }

    async fn touch(&self, id: CredentialId, at: DateTime<Utc>) -> Result<(), CredentialError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id).ok_or_else(|| not_found(id))?;
        entry.metadata.mark_used(at);
        Ok(())
    }

    async fn delete(&self, id: CredentialId) -> Result<(), CredentialError> {
        self.entries
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found(id).into())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Credential>, CredentialError> {
        let mut found: Vec<_> = self
            .entries
            .read()
            .await
            .values()
            .filter(|c| c.metadata.owner_id == user_id)
            .map(|c| c.metadata.clone())
            .collect();
        found.sort_by_key(|c| c.created_at);
        Ok(found)
    }
}
