use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use cadence_coordination::jobs::EmailJobOutcome;
use cadence_coordination::{ClaimableStore, StoreError};
use cadence_core::{
    AccountId, Coordinate, EmailJobStatus, JobId, MaintenanceEmailJob, Recipient, RecipientId,
};

use super::{count_from_db, map_sqlx_error};

/// Maintenance-email jobs in Postgres.
///
/// `claim` is a conditional `UPDATE ... WHERE status = 'pending' AND scheduled_for <= $2`
/// and, only when it
/// changed exactly one row, a read of the job and its recipients, all in one
/// transaction.
#[derive(Debug, Clone)]
pub struct PgMaintenanceJobStore {
    pool: Arc<PgPool>,
}

impl PgMaintenanceJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Recipients for many jobs in one `job_id = ANY($1)` query.
    #[instrument(skip(conn, job_ids), fields(job_count = job_ids.len()), err)]
    async fn load_recipients(
        conn: &mut PgConnection,
        job_ids: &[JobId],
    ) -> Result<HashMap<JobId, Vec<Recipient>>, StoreError> {
        let ids: Vec<Uuid> = job_ids.iter().map(|id| *id.as_uuid()).collect();
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, email, display_name, bike_name, last_known_lat, last_known_lon
            FROM maintenance_email_recipients
            WHERE job_id = ANY($1)
            ORDER BY job_id, email
            "#,
        )
        .bind(ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("load_recipients", e))?;

        let mut by_job: HashMap<JobId, Vec<Recipient>> = HashMap::new();
        for row in rows {
            let job_id: Uuid = row
                .try_get("job_id")
                .map_err(|e| map_sqlx_error("load_recipients", e))?;
            let recipient = recipient_from_row(&row)
                .map_err(|e| map_sqlx_error("load_recipients", e))?;
            by_job
                .entry(JobId::from_uuid(job_id))
                .or_default()
                .push(recipient);
        }
        Ok(by_job)
    }
}

#[async_trait]
impl ClaimableStore for PgMaintenanceJobStore {
    type Record = MaintenanceEmailJob;

    #[instrument(skip(self), err)]
    async fn select_due(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM maintenance_email_jobs
            WHERE status = 'pending' AND scheduled_for <= $1
            ORDER BY scheduled_for ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_due", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<Uuid, _>("id")
                    .map(JobId::from_uuid)
                    .map_err(|e| map_sqlx_error("select_due", e))
            })
            .collect()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn claim(
        &self,
        id: JobId,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<MaintenanceEmailJob>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let updated = sqlx::query(
            r#"
            UPDATE maintenance_email_jobs
            SET status = 'processing', updated_at = now()
            WHERE id = $1 AND status = 'pending' AND scheduled_for <= $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        if updated.rows_affected() != 1 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            debug!("job already claimed or gone");
            return Ok(None);
        }

        let row = sqlx::query(
            r#"
            SELECT id, account_id, template_key, scheduled_for, status,
                   sent_count, failed_count, failure_reason, created_at, updated_at
            FROM maintenance_email_jobs
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_read", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        };

        let mut job = job_from_row(&row)?;
        let mut recipients = Self::load_recipients(&mut tx, &[id]).await?;
        job.recipients = recipients.remove(&id).unwrap_or_default();

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Some(job))
    }

    #[instrument(skip(self, outcome), fields(job_id = %id, status = outcome.status.as_str()), err)]
    async fn finish(&self, id: JobId, outcome: &EmailJobOutcome) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE maintenance_email_jobs
            SET status = $2, sent_count = $3, failed_count = $4, failure_reason = $5,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(outcome.status.as_str())
        .bind(i32::try_from(outcome.sent).unwrap_or(i32::MAX))
        .bind(i32::try_from(outcome.failed).unwrap_or(i32::MAX))
        .bind(outcome.reason.as_deref())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finish", e))?;

        Ok(updated.rows_affected() == 1)
    }
}

fn job_from_row(row: &PgRow) -> Result<MaintenanceEmailJob, StoreError> {
    let decode = |e| map_sqlx_error("job_from_row", e);
    let status: String = row.try_get("status").map_err(decode)?;
    let status = status
        .parse::<EmailJobStatus>()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(MaintenanceEmailJob {
        id: JobId::from_uuid(row.try_get("id").map_err(decode)?),
        account_id: AccountId::from_uuid(row.try_get("account_id").map_err(decode)?),
        template_key: row.try_get("template_key").map_err(decode)?,
        scheduled_for: row.try_get("scheduled_for").map_err(decode)?,
        status,
        recipients: Vec::new(),
        sent_count: count_from_db(row.try_get("sent_count").map_err(decode)?),
        failed_count: count_from_db(row.try_get("failed_count").map_err(decode)?),
        failure_reason: row.try_get("failure_reason").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

fn recipient_from_row(row: &PgRow) -> Result<Recipient, sqlx::Error> {
    let lat: Option<f64> = row.try_get("last_known_lat")?;
    let lon: Option<f64> = row.try_get("last_known_lon")?;
    let last_known_location = match (lat, lon) {
        (Some(lat), Some(lon)) => Coordinate::new(lat, lon).ok(),
        _ => None,
    };

    Ok(Recipient {
        id: RecipientId::from_uuid(row.try_get("id")?),
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        bike_name: row.try_get("bike_name")?,
        last_known_location,
    })
}
