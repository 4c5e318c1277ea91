//! Stale-session reaper.
//!
//! Active sessions idle past the timeout are claimed (`active -> closing`), handed to
//! a [`SessionFinalizer`], then written as `expired` (or `failed` with a reason).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cadence_core::{Session, SessionId, SessionStatus};

use crate::claim::{ClaimRecord, ClaimableStore, InMemoryClaimStore};
use crate::coordinator::{CoordinatorConfig, ScanJob};
use crate::error::JobError;
use crate::lease::OnUnavailable;

pub const COORDINATOR_NAME: &str = "stale-session-reaper";
pub const LEASE_KEY: &str = "lease:stale-session-reaper";
pub const LEASE_TTL: Duration = Duration::from_secs(2 * 60);
pub const INTERVAL: Duration = Duration::from_secs(30);
pub const BATCH_SIZE: usize = 50;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub type InMemorySessionStore = InMemoryClaimStore<Session>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub status: SessionStatus,
    pub reason: Option<String>,
}

impl ClaimRecord for Session {
    type Id = SessionId;
    type Terminal = SessionOutcome;

    fn record_id(&self) -> SessionId {
        self.id
    }

    fn is_due(&self, cutoff: DateTime<Utc>) -> bool {
        self.is_idle_since(cutoff)
    }

    fn due_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }

    fn mark_claimed(&mut self, _now: DateTime<Utc>) {
        self.status = SessionStatus::Closing;
    }

    fn apply_terminal(&mut self, outcome: &SessionOutcome, now: DateTime<Utc>) {
        self.status = outcome.status;
        self.failure_reason = outcome.reason.clone();
        self.closed_at = Some(now);
    }
}

/// Releases whatever an expiring session holds (e.g. closes the ride recording).
#[async_trait]
pub trait SessionFinalizer: Send + Sync {
    async fn finalize(&self, session: &Session) -> Result<(), JobError>;
}

/// Finalizer for deployments with nothing to release beyond the status change.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFinalizer;

#[async_trait]
impl SessionFinalizer for NoopFinalizer {
    async fn finalize(&self, _session: &Session) -> Result<(), JobError> {
        Ok(())
    }
}

pub struct StaleSessionReaper<S> {
    store: S,
    finalizer: Arc<dyn SessionFinalizer>,
    idle_timeout: chrono::Duration,
}

impl<S> StaleSessionReaper<S> {
    pub fn new(store: S, finalizer: Arc<dyn SessionFinalizer>, idle_timeout: Duration) -> Self {
        Self {
            store,
            finalizer,
            idle_timeout: chrono::Duration::from_std(idle_timeout)
                .unwrap_or_else(|_| chrono::Duration::minutes(30)),
        }
    }
}

#[async_trait]
impl<S> ScanJob for StaleSessionReaper<S>
where
    S: ClaimableStore<Record = Session> + 'static,
{
    type Store = S;

    fn store(&self) -> &S {
        &self.store
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.idle_timeout
    }

    async fn execute(&self, session: &Session) -> Result<SessionOutcome, JobError> {
        self.finalizer.finalize(session).await?;
        Ok(SessionOutcome {
            status: SessionStatus::Expired,
            reason: None,
        })
    }

    fn failure_terminal(&self, _session: &Session, error: &JobError) -> SessionOutcome {
        SessionOutcome {
            status: SessionStatus::Failed,
            reason: Some(error.to_string()),
        }
    }
}

/// Production schedule: every 30 seconds, 50 sessions per scan, skips the cycle
/// when the lease store is down.
pub fn reaper_config() -> CoordinatorConfig {
    CoordinatorConfig::new(COORDINATOR_NAME, LEASE_KEY, OnUnavailable::Skip)
        .with_interval(INTERVAL)
        .with_batch_size(BATCH_SIZE)
        .with_lease_ttl(LEASE_TTL)
}
