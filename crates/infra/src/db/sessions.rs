use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use cadence_coordination::jobs::SessionOutcome;
use cadence_coordination::{ClaimableStore, StoreError};
use cadence_core::{AccountId, Session, SessionId, SessionStatus};

use super::map_sqlx_error;

/// User sessions in Postgres. Claiming moves `active -> closing`, and only while the
/// session is still idle at the scan cutoff.
#[derive(Debug, Clone)]
pub struct PgSessionStore {
    pool: Arc<PgPool>,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl ClaimableStore for PgSessionStore {
    type Record = Session;

    #[instrument(skip(self), err)]
    async fn select_due(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SessionId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM sessions
            WHERE status = 'active' AND last_activity_at <= $1
            ORDER BY last_activity_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_idle_sessions", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<Uuid, _>("id")
                    .map(SessionId::from_uuid)
                    .map_err(|e| map_sqlx_error("select_idle_sessions", e))
            })
            .collect()
    }

    #[instrument(skip(self), fields(session_id = %id), err)]
    async fn claim(
        &self,
        id: SessionId,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let updated = sqlx::query(
            r#"
            UPDATE sessions
            SET status = 'closing'
            WHERE id = $1 AND status = 'active' AND last_activity_at <= $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_session", e))?;

        if updated.rows_affected() != 1 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            debug!("session already claimed, gone or active again");
            return Ok(None);
        }

        let row = sqlx::query(
            r#"
            SELECT id, account_id, status, last_activity_at, created_at, closed_at, failure_reason
            FROM sessions
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_session_read", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        };
        let session = session_from_row(&row)?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Some(session))
    }

    #[instrument(skip(self, outcome), fields(session_id = %id, status = outcome.status.as_str()), err)]
    async fn finish(&self, id: SessionId, outcome: &SessionOutcome) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE sessions
            SET status = $2, failure_reason = $3, closed_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(outcome.status.as_str())
        .bind(outcome.reason.as_deref())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finish_session", e))?;

        Ok(updated.rows_affected() == 1)
    }
}

fn session_from_row(row: &PgRow) -> Result<Session, StoreError> {
    let decode = |e| map_sqlx_error("session_from_row", e);
    let status: String = row.try_get("status").map_err(decode)?;

    Ok(Session {
        id: SessionId::from_uuid(row.try_get("id").map_err(decode)?),
        account_id: AccountId::from_uuid(row.try_get("account_id").map_err(decode)?),
        status: status
            .parse::<SessionStatus>()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        last_activity_at: row.try_get("last_activity_at").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        closed_at: row.try_get("closed_at").map_err(decode)?,
        failure_reason: row.try_get("failure_reason").map_err(decode)?,
    })
}
