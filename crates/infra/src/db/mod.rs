//! Postgres-backed claim stores and token repository.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | StoreError | Scenario |
//! |------------|------------|----------|
//! | `PoolClosed`, `PoolTimedOut`, `Io`, `Tls` | `Unavailable` | Database unreachable |
//! | `Database` | `Command` | Statement rejected by the server |
//! | `ColumnDecode`, `Decode`, `ColumnNotFound` | `Serialization` | Schema drift |
//! | Other | `Command` | Anything else |
//!
//! ## Expected schema
//!
//! ```sql
//! CREATE TABLE maintenance_email_jobs (
//!     id UUID PRIMARY KEY,
//!     account_id UUID NOT NULL,
//!     template_key TEXT NOT NULL,
//!     scheduled_for TIMESTAMPTZ NOT NULL,
//!     status TEXT NOT NULL,
//!     sent_count INTEGER NOT NULL DEFAULT 0,
//!     failed_count INTEGER NOT NULL DEFAULT 0,
//!     failure_reason TEXT,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL
//! );
//! CREATE TABLE maintenance_email_recipients (
//!     id UUID PRIMARY KEY,
//!     job_id UUID NOT NULL REFERENCES maintenance_email_jobs (id) ON DELETE CASCADE,
//!     email TEXT NOT NULL,
//!     display_name TEXT,
//!     bike_name TEXT,
//!     last_known_lat DOUBLE PRECISION,
//!     last_known_lon DOUBLE PRECISION
//! );
//! CREATE TABLE sessions (
//!     id UUID PRIMARY KEY,
//!     account_id UUID NOT NULL,
//!     status TEXT NOT NULL,
//!     last_activity_at TIMESTAMPTZ NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     closed_at TIMESTAMPTZ,
//!     failure_reason TEXT
//! );
//! CREATE TABLE account_tokens (
//!     account_id UUID PRIMARY KEY,
//!     access_token TEXT NOT NULL,
//!     refresh_token TEXT NOT NULL,
//!     expires_at TIMESTAMPTZ NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL
//! );
//! ```

mod maintenance;
mod sessions;
mod tokens;

pub use maintenance::PgMaintenanceJobStore;
pub use sessions::PgSessionStore;
pub use tokens::PgTokenRepository;

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use cadence_coordination::StoreError;

/// Open a small pool; the workers issue one statement at a time per coordinator.
pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            StoreError::unavailable(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => StoreError::unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::unavailable(format!("tls error in {operation}: {e}")),
        sqlx::Error::Database(db_err) => {
            StoreError::command(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Serialization(format!("row decode failed in {operation}: {err}"))
        }
        other => StoreError::command(format!("sqlx error in {operation}: {other}")),
    }
}

/// Counters are stored as INTEGER; negative values never come from this code.
pub(crate) fn count_from_db(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_failures_map_to_unavailable() {
        assert!(matches!(
            map_sqlx_error("claim", sqlx::Error::PoolClosed),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error("claim", sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
    }

    #[test]
    fn decode_failures_map_to_serialization() {
        let err = sqlx::Error::ColumnNotFound("status".into());
        assert!(matches!(
            map_sqlx_error("select_due", err),
            StoreError::Serialization(_)
        ));
    }

    #[test]
    fn other_failures_map_to_command() {
        assert!(matches!(
            map_sqlx_error("finish", sqlx::Error::RowNotFound),
            StoreError::Command(_)
        ));
    }

    #[test]
    fn negative_counts_clamp_to_zero() {
        assert_eq!(count_from_db(3), 3);
        assert_eq!(count_from_db(-1), 0);
    }
}
