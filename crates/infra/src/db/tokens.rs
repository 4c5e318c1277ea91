use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use cadence_coordination::StoreError;
use cadence_core::AccountId;

use crate::external::tokens::{TokenRepository, TokenSet};

use super::map_sqlx_error;

/// OAuth tokens for linked ride-tracking accounts, one row per account.
#[derive(Debug, Clone)]
pub struct PgTokenRepository {
    pool: Arc<PgPool>,
}

impl PgTokenRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl TokenRepository for PgTokenRepository {
    #[instrument(skip(self), fields(account_id = %account), err)]
    async fn load(&self, account: AccountId) -> Result<Option<TokenSet>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT access_token, refresh_token, expires_at
            FROM account_tokens
            WHERE account_id = $1
            "#,
        )
        .bind(account.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_tokens", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let decode = |e| map_sqlx_error("load_tokens", e);
        Ok(Some(TokenSet {
            access_token: row.try_get("access_token").map_err(decode)?,
            refresh_token: row.try_get("refresh_token").map_err(decode)?,
            expires_at: row.try_get("expires_at").map_err(decode)?,
        }))
    }

    #[instrument(skip(self, tokens), fields(account_id = %account), err)]
    async fn save(&self, account: AccountId, tokens: &TokenSet) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO account_tokens (account_id, access_token, refresh_token, expires_at, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (account_id) DO UPDATE
            SET access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                expires_at = EXCLUDED.expires_at,
                updated_at = now()
            "#,
        )
        .bind(account.as_uuid())
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(tokens.expires_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_tokens", e))?;
        Ok(())
    }
}
