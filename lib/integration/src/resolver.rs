//! Turning a `credentialId` from a node config into usable secret data.

use crate::cipher::CredentialCipher;
use crate::credential::{Credential, CredentialData, CredentialVault, StoredCredential};
use crate::error::CredentialError;
use async_trait::async_trait;
use chrono::Utc;
use flowforge_core::{CredentialId, Result, UserId};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// A decrypted credential, alive only for the duration of one node call.
#[derive(Clone)]
pub struct ResolvedCredential {
    pub id: CredentialId,
    pub provider: String,
    pub data: CredentialData,
}

impl fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("data", &"[redacted]")
            .finish()
    }
}

/// Something that can hand out decrypted credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Resolves an opaque credential reference.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::NotFound`] for unknown or malformed ids and
    /// [`CredentialError::DecryptionFailed`] when the payload cannot be opened.
    async fn resolve(&self, credential_id: &str) -> Result<ResolvedCredential, CredentialError>;
}

/// Vault-backed credential provider.
#[derive(Clone)]
pub struct CredentialResolver {
    vault: Arc<dyn CredentialVault>,
    cipher: CredentialCipher,
}

impl CredentialResolver {
    #[must_use]
    pub fn new(vault: Arc<dyn CredentialVault>, cipher: CredentialCipher) -> Self {
        Self { vault, cipher }
    }

    /// Encrypts and stores a new credential.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption or storage fails.
    #[instrument(skip(self, data), fields(provider = %provider))]
    pub async fn seal(
        &self,
        owner_id: UserId,
        name: &str,
        provider: &str,
        data: &CredentialData,
    ) -> Result<Credential, CredentialError> {
        let plaintext = serde_json::to_vec(data).map_err(|e| CredentialError::InvalidFormat {
            reason: e.to_string(),
        })?;
        let ciphertext = self.cipher.encrypt(&plaintext)?;
        let metadata = Credential::new(owner_id, name, data.credential_type(), provider);
        self.vault
            .store(StoredCredential {
                metadata: metadata.clone(),
                ciphertext,
            })
            .await?;
        debug!(credential_id = %metadata.id, "credential sealed");
        Ok(metadata)
    }

    /// Lists a user's credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the vault fails.
    pub async fn list(&self, owner_id: UserId) -> Result<Vec<Credential>, CredentialError> {
        self.vault.list_for_user(owner_id).await
    }

    /// Deletes a credential.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential does not exist.
    pub async fn delete(&self, id: CredentialId) -> Result<(), CredentialError> {
        self.vault.delete(id).await
    }
}

#[async_trait]
impl CredentialProvider for CredentialResolver {
    #[instrument(skip(self), fields(credential_id = %credential_id))]
    async fn resolve(&self, credential_id: &str) -> Result<ResolvedCredential, CredentialError> {
        let id: CredentialId = credential_id.parse().map_err(|_| CredentialError::NotFound {
            id: credential_id.to_string(),
        })?;

        let stored = self.vault.get(id).await?;
        let plaintext = self
            .cipher
            .decrypt(&stored.ciphertext)
            .map_err(|_| CredentialError::DecryptionFailed { id: Some(id) })?;
        let data: CredentialData =
            serde_json::from_slice(&plaintext).map_err(|e| CredentialError::InvalidFormat {
                reason: e.to_string(),
            })?;

        // A failed stamp does not fail resolution.
        if let Err(e) = self.vault.touch(id, Utc::now()).await {
            warn!(error = %e, "failed to stamp credential use");
        }

        debug!(provider = %stored.metadata.provider, "credential resolved");
        Ok(ResolvedCredential {
            id,
            provider: stored.metadata.provider,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::MemoryCredentialVault;

    fn resolver() -> (CredentialResolver, Arc<MemoryCredentialVault>) {
        let vault = Arc::new(MemoryCredentialVault::new());
        let cipher = CredentialCipher::new(&[9u8; 32]).expect("key");
        (CredentialResolver::new(vault.clone(), cipher), vault)
    }

    #[tokio::test]
    async fn seal_then_resolve() {
        let (resolver, vault) = resolver();
        let data = CredentialData::BearerToken {
            token: "xoxb-1".to_string(),
        };
        let credential = resolver
            .seal(UserId::new(), "bot", "slack", &data)
            .await
            .expect("seal");

        let stored = vault.get(credential.id).await.expect("stored");
        assert!(!String::from_utf8_lossy(&stored.ciphertext).contains("xoxb-1"));

        let resolved = resolver
            .resolve(&credential.id.to_string())
            .await
            .expect("resolve");
        assert_eq!(resolved.data, data);
        assert_eq!(resolved.provider, "slack");
        assert!(!format!("{resolved:?}").contains("xoxb"));

        let touched = vault.get(credential.id).await.expect("stored");
        assert!(touched.metadata.last_used_at.is_some());
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_are_not_found() {
        let (resolver, _) = resolver();
        for id in ["garbage".to_string(), CredentialId::new().to_string()] {
            let err = resolver.resolve(&id).await.unwrap_err();
            assert!(matches!(err.current_context(), CredentialError::NotFound { .. }));
        }
    }

    #[tokio::test]
    async fn wrong_key_fails_decryption() {
        let (resolver, vault) = resolver();
        let credential = resolver
            .seal(UserId::new(), "gh", "github", &CredentialData::api_key("k"))
            .await
            .expect("seal");

        let other = CredentialResolver::new(vault, CredentialCipher::new(&[1u8; 32]).expect("key"));
        let err = other.resolve(&credential.id.to_string()).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            CredentialError::DecryptionFailed { .. }
        ));
    }
}
