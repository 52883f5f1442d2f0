//! Sealed credential storage.

use super::decode;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowforge_core::{CredentialId, Result, UserId};
use flowforge_integration::{Credential, CredentialError, CredentialVault, StoredCredential};
use sqlx::{FromRow, PgPool};
use tracing::{debug, instrument};

/// Row type for credential queries.
#[derive(FromRow)]
struct CredentialRow {
    id: String,
    owner_id: String,
    name: String,
    credential_type: String,
    provider: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
}

impl CredentialRow {
    fn try_into_credential(self) -> std::result::Result<Credential, sqlx::Error> {
        Ok(Credential {
            id: decode("credential id", &self.id)?,
            owner_id: decode("user id", &self.owner_id)?,
            name: self.name,
            credential_type: decode("credential type", &self.credential_type)?,
            provider: self.provider,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_used_at: self.last_used_at,
        })
    }
}

/// Row type for loads that include the secret.
#[derive(FromRow)]
struct SealedRow {
    #[sqlx(flatten)]
    metadata: CredentialRow,
    ciphertext: Vec<u8>,
}

fn storage(e: impl std::fmt::Display) -> CredentialError {
    CredentialError::StorageFailed {
        reason: e.to_string(),
    }
}

fn not_found(id: CredentialId) -> CredentialError {
    CredentialError::NotFound { id: id.to_string() }
}

/// Credential vault over the `credentials` table.
#[derive(Clone)]
pub struct PgCredentialVault {
    pool: PgPool,
}

impl PgCredentialVault {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialVault for PgCredentialVault {
    #[instrument(skip(self, credential), fields(credential_id = %credential.metadata.id))]
    async fn store(&self, credential: StoredCredential) -> Result<CredentialId, CredentialError> {
        let metadata = &credential.metadata;
        sqlx::query(
            r#"
            INSERT INTO credentials (id, owner_id, name, credential_type, provider, ciphertext,
                                     created_at, updated_at, last_used_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, credential_type = EXCLUDED.credential_type,
                provider = EXCLUDED.provider, ciphertext = EXCLUDED.ciphertext,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(metadata.id.to_string())
        .bind(metadata.owner_id.to_string())
        .bind(&metadata.name)
        .bind(metadata.credential_type.as_str())
        .bind(&metadata.provider)
        .bind(&credential.ciphertext)
        .bind(metadata.created_at)
        .bind(metadata.updated_at)
        .bind(metadata.last_used_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        debug!("credential stored");
        Ok(metadata.id)
    }

    async fn get(&self, id: CredentialId) -> Result<StoredCredential, CredentialError> {
        let row: Option<SealedRow> = sqlx::query_as(
            r#"
            SELECT id, owner_id, name, credential_type, provider, created_at, updated_at,
                   last_used_at, ciphertext
            FROM credentials
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        let row = row.ok_or_else(|| not_found(id))?;
        Ok(StoredCredential {
            metadata: row.metadata.try_into_credential().map_err(storage)?,
            ciphertext: row.ciphertext,
        })
    }

    async fn touch(&self, id: CredentialId, at: DateTime<Utc>) -> Result<(), CredentialError> {
        // GREATEST ignores NULL, so the first use sets the column.
        let updated = sqlx::query(
            "UPDATE credentials SET last_used_at = GREATEST(last_used_at, $2) WHERE id = $1",
        )
        .bind(id.to_string())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if updated.rows_affected() == 0 {
            return Err(not_found(id).into());
        }
        Ok(())
    }

    async fn delete(&self, id: CredentialId) -> Result<(), CredentialError> {
        let deleted = sqlx::query("DELETE FROM credentials WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        if deleted.rows_affected() == 0 {
            return Err(not_found(id).into());
        }
        Ok(())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Credential>, CredentialError> {
        let rows: Vec<CredentialRow> = sqlx::query_as(
            r#"
            SELECT id, owner_id, name, credential_type, provider, created_at, updated_at, last_used_at
            FROM credentials
            WHERE owner_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.into_iter()
            .map(|row| row.try_into_credential().map_err(|e| storage(e).into()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_integration::CredentialType;

    #[test]
    fn row_converts_to_metadata() {
        let credential = Credential::new(UserId::new(), "Warehouse", CredentialType::ConnectionString, "postgres");
        let row = CredentialRow {
            id: credential.id.to_string(),
            owner_id: credential.owner_id.to_string(),
            name: credential.name.clone(),
            credential_type: credential.credential_type.as_str().to_string(),
            provider: credential.provider.clone(),
            created_at: credential.created_at,
            updated_at: credential.updated_at,
            last_used_at: None,
        };
        assert_eq!(row.try_into_credential().expect("convert"), credential);
    }

    #[test]
    fn storage_errors_keep_the_reason() {
        let err = storage("connection reset");
        assert!(matches!(err, CredentialError::StorageFailed { ref reason } if reason == "connection reset"));
    }
}
