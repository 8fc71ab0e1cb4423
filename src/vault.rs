use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::ExecError;

/// Live API key material for one (user, exchange) pair.
///
/// Encryption at rest belongs to the credential service that writes these
/// rows; the vault only resolves them.
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
}

/// Resolves per-user, per-exchange credentials for gateway use.
pub struct CredentialVault {
    pool: PgPool,
}

impl CredentialVault {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Look up credentials, failing with `CredentialsMissing` when the
    /// user has not configured the exchange.
    pub async fn resolve(
        &self,
        user_id: Uuid,
        exchange_name: &str,
    ) -> Result<ApiCredentials, ExecError> {
        let row = sqlx::query(
            r#"
            SELECT api_key, api_secret
            FROM api_credentials
            WHERE user_id = $1 AND exchange_name = $2
            "#,
        )
        .bind(user_id)
        .bind(exchange_name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(ApiCredentials {
                api_key: row.get("api_key"),
                api_secret: row.get("api_secret"),
            }),
            None => Err(ExecError::CredentialsMissing(exchange_name.to_string())),
        }
    }

    /// Upsert credentials for a user. Exposed for provisioning and tests;
    /// the production write path is the credential service.
    pub async fn store(
        &self,
        user_id: Uuid,
        exchange_name: &str,
        api_key: &str,
        api_secret: &str,
    ) -> Result<(), ExecError> {
        sqlx::query(
            r#"
            INSERT INTO api_credentials (user_id, exchange_name, api_key, api_secret)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, exchange_name) DO UPDATE SET
                api_key = EXCLUDED.api_key,
                api_secret = EXCLUDED.api_secret,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(exchange_name)
        .bind(api_key)
        .bind(api_secret)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
