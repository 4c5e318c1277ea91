//! Maintenance-email dispatcher.
//!
//! Claims due `pending` jobs, resolves each recipient's last known bike location to
//! a place label (optional), and hands one email per recipient to the mailer.
//! Rendering and delivery belong to the [`MaintenanceMailer`] collaborator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use cadence_core::{AccountId, Coordinate, EmailJobStatus, JobId, MaintenanceEmailJob};

use crate::claim::{ClaimRecord, ClaimableStore, InMemoryClaimStore};
use crate::coordinator::{CoordinatorConfig, ScanJob};
use crate::error::JobError;
use crate::lease::OnUnavailable;

pub const COORDINATOR_NAME: &str = "maintenance-email-dispatch";
pub const LEASE_KEY: &str = "lease:maintenance-email-dispatch";
pub const LEASE_TTL: Duration = Duration::from_secs(5 * 60);
pub const INTERVAL: Duration = Duration::from_secs(60);
pub const BATCH_SIZE: usize = 10;
pub const NO_RECIPIENTS: &str = "job has no recipients";

pub type InMemoryMaintenanceJobStore = InMemoryClaimStore<MaintenanceEmailJob>;

/// Terminal state written for a dispatched job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailJobOutcome {
    pub status: EmailJobStatus,
    pub sent: u32,
    pub failed: u32,
    pub reason: Option<String>,
}

impl ClaimRecord for MaintenanceEmailJob {
    type Id = JobId;
    type Terminal = EmailJobOutcome;

    fn record_id(&self) -> JobId {
        self.id
    }

    fn is_due(&self, cutoff: DateTime<Utc>) -> bool {
        MaintenanceEmailJob::is_due(self, cutoff)
    }

    fn due_at(&self) -> DateTime<Utc> {
        self.scheduled_for
    }

    fn mark_claimed(&mut self, now: DateTime<Utc>) {
        self.status = EmailJobStatus::Processing;
        self.updated_at = now;
    }

    fn apply_terminal(&mut self, outcome: &EmailJobOutcome, now: DateTime<Utc>) {
        self.status = outcome.status;
        self.sent_count = outcome.sent;
        self.failed_count = outcome.failed;
        self.failure_reason = outcome.reason.clone();
        self.updated_at = now;
    }
}

/// One email handed to the mailer.
#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceEmail {
    pub job_id: JobId,
    pub account_id: AccountId,
    pub template_key: String,
    pub to: String,
    pub display_name: Option<String>,
    pub bike_name: Option<String>,
    /// Human-readable place for the bike's last known location, when resolvable.
    pub location_label: Option<String>,
}

#[async_trait]
pub trait MaintenanceMailer: Send + Sync {
    async fn send(&self, email: &MaintenanceEmail) -> Result<(), JobError>;
}

/// Coordinate to place label. `None` covers both "nothing there" and upstream trouble.
#[async_trait]
pub trait PlaceLookup: Send + Sync {
    async fn place_label(&self, location: Coordinate) -> Option<String>;
}

pub struct MaintenanceDispatchJob<S> {
    store: S,
    mailer: Arc<dyn MaintenanceMailer>,
    places: Option<Arc<dyn PlaceLookup>>,
}

impl<S> MaintenanceDispatchJob<S> {
    pub fn new(store: S, mailer: Arc<dyn MaintenanceMailer>) -> Self {
        Self {
            store,
            mailer,
            places: None,
        }
    }

    pub fn with_place_lookup(mut self, places: Arc<dyn PlaceLookup>) -> Self {
        self.places = Some(places);
        self
    }

    async fn location_label(&self, location: Option<Coordinate>) -> Option<String> {
        let places = self.places.as_ref()?;
        places.place_label(location?).await
    }
}

#[async_trait]
impl<S> ScanJob for MaintenanceDispatchJob<S>
where
    S: ClaimableStore<Record = MaintenanceEmailJob> + 'static,
{
    type Store = S;

    fn store(&self) -> &S {
        &self.store
    }

    async fn execute(&self, job: &MaintenanceEmailJob) -> Result<EmailJobOutcome, JobError> {
        if job.recipients.is_empty() {
            return Err(JobError::invalid(NO_RECIPIENTS));
        }

        let mut sent = 0u32;
        let mut failed = 0u32;
        let mut last_error = None;

        for recipient in &job.recipients {
            let email = MaintenanceEmail {
                job_id: job.id,
                account_id: job.account_id,
                template_key: job.template_key.clone(),
                to: recipient.email.clone(),
                display_name: recipient.display_name.clone(),
                bike_name: recipient.bike_name.clone(),
                location_label: self.location_label(recipient.last_known_location).await,
            };

            match self.mailer.send(&email).await {
                Ok(()) => sent += 1,
                Err(err) => {
                    warn!(
                        job_id = %job.id,
                        recipient_id = %recipient.id,
                        error = %err,
                        "maintenance email delivery failed"
                    );
                    failed += 1;
                    last_error = Some(err.to_string());
                }
            }
        }

        debug!(job_id = %job.id, sent, failed, "maintenance job dispatched");
        let outcome = match (sent, last_error) {
            (_, None) => EmailJobOutcome {
                status: EmailJobStatus::Sent,
                sent,
                failed,
                reason: None,
            },
            (0, Some(last)) => EmailJobOutcome {
                status: EmailJobStatus::Failed,
                sent,
                failed,
                reason: Some(format!("all {failed} recipients failed; last error: {last}")),
            },
            (_, Some(last)) => EmailJobOutcome {
                status: EmailJobStatus::Sent,
                sent,
                failed,
                reason: Some(format!("{failed} recipient(s) failed; last error: {last}")),
            },
        };
        Ok(outcome)
    }

    fn failure_terminal(&self, job: &MaintenanceEmailJob, error: &JobError) -> EmailJobOutcome {
        let reason = match error {
            JobError::Invalid(reason) => reason.clone(),
            other => other.to_string(),
        };
        EmailJobOutcome {
            status: EmailJobStatus::Failed,
            sent: 0,
            failed: job.recipients.len() as u32,
            reason: Some(reason),
        }
    }
}

/// Production schedule: every minute, ten jobs per scan, runs unlocked when the
/// lease store is down (claims still prevent double sends).
pub fn dispatcher_config() -> CoordinatorConfig {
    CoordinatorConfig::new(COORDINATOR_NAME, LEASE_KEY, OnUnavailable::ProceedUnlocked)
        .with_interval(INTERVAL)
        .with_batch_size(BATCH_SIZE)
        .with_lease_ttl(LEASE_TTL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{PeriodicCoordinator, ScanReport};
    use crate::kv::InMemoryKvStore;
    use crate::lease::DistributedLease;
    use cadence_core::Recipient;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<MaintenanceEmail>>,
        reject: HashSet<String>,
    }

    impl RecordingMailer {
        fn rejecting(addresses: &[&str]) -> Self {
            Self {
                reject: addresses.iter().map(|a| a.to_string()).collect(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl MaintenanceMailer for RecordingMailer {
        async fn send(&self, email: &MaintenanceEmail) -> Result<(), JobError> {
            if self.reject.contains(&email.to) {
                return Err(JobError::upstream(format!("mailbox unavailable: {}", email.to)));
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    struct FixedPlace;

    #[async_trait]
    impl PlaceLookup for FixedPlace {
        async fn place_label(&self, _location: Coordinate) -> Option<String> {
            Some("Denver, Colorado".to_string())
        }
    }

    fn due_job(recipients: Vec<Recipient>) -> MaintenanceEmailJob {
        MaintenanceEmailJob::new(
            AccountId::new(),
            "chain-wear",
            Utc::now() - chrono::Duration::minutes(1),
            recipients,
        )
    }

    fn dispatcher(
        store: &Arc<InMemoryMaintenanceJobStore>,
        mailer: Arc<RecordingMailer>,
    ) -> PeriodicCoordinator<MaintenanceDispatchJob<Arc<InMemoryMaintenanceJobStore>>> {
        let job = MaintenanceDispatchJob::new(store.clone(), mailer)
            .with_place_lookup(Arc::new(FixedPlace));
        PeriodicCoordinator::new(
            job,
            DistributedLease::new(InMemoryKvStore::arc()),
            dispatcher_config(),
        )
    }

    #[tokio::test]
    async fn sends_one_email_per_recipient() {
        let store = InMemoryMaintenanceJobStore::arc();
        let denver = Coordinate::new(39.7392, -104.9903).unwrap();
        let job = due_job(vec![
            Recipient::new("ana@example.com")
                .with_bike("Gravel")
                .with_location(denver),
            Recipient::new("bo@example.com"),
        ]);
        let id = job.id;
        store.insert(job);

        let mailer = Arc::new(RecordingMailer::default());
        dispatcher(&store, mailer.clone()).run_once().await;

        let stored = store.get(id).unwrap();
        assert_eq!(stored.status, EmailJobStatus::Sent);
        assert_eq!((stored.sent_count, stored.failed_count), (2, 0));

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].location_label.as_deref(), Some("Denver, Colorado"));
        assert_eq!(sent[0].bike_name.as_deref(), Some("Gravel"));
        assert_eq!(sent[1].location_label, None);
    }

    #[tokio::test]
    async fn partial_failure_is_sent_with_counters() {
        let store = InMemoryMaintenanceJobStore::arc();
        let job = due_job(vec![
            Recipient::new("ok@example.com"),
            Recipient::new("bounce@example.com"),
        ]);
        let id = job.id;
        store.insert(job);

        let mailer = Arc::new(RecordingMailer::rejecting(&["bounce@example.com"]));
        dispatcher(&store, mailer).run_once().await;

        let stored = store.get(id).unwrap();
        assert_eq!(stored.status, EmailJobStatus::Sent);
        assert_eq!((stored.sent_count, stored.failed_count), (1, 1));
        assert!(stored.failure_reason.unwrap().contains("bounce@example.com"));
    }

    #[tokio::test]
    async fn all_recipients_failing_marks_job_failed() {
        let store = InMemoryMaintenanceJobStore::arc();
        let job = due_job(vec![Recipient::new("bounce@example.com")]);
        let id = job.id;
        store.insert(job);

        let mailer = Arc::new(RecordingMailer::rejecting(&["bounce@example.com"]));
        dispatcher(&store, mailer).run_once().await;

        let stored = store.get(id).unwrap();
        assert_eq!(stored.status, EmailJobStatus::Failed);
        assert_eq!((stored.sent_count, stored.failed_count), (0, 1));
    }

    #[tokio::test]
    async fn job_without_recipients_fails_with_reason() {
        let store = InMemoryMaintenanceJobStore::arc();
        let job = due_job(vec![]);
        let id = job.id;
        store.insert(job);

        let report = dispatcher(&store, Arc::new(RecordingMailer::default()))
            .run_once()
            .await;
        assert!(matches!(report, ScanReport::Completed(s) if s.failed == 1));

        let stored = store.get(id).unwrap();
        assert_eq!(stored.status, EmailJobStatus::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some(NO_RECIPIENTS));
    }

    #[tokio::test]
    async fn future_jobs_are_left_pending() {
        let store = InMemoryMaintenanceJobStore::arc();
        let job = MaintenanceEmailJob::new(
            AccountId::new(),
            "brake-pads",
            Utc::now() + chrono::Duration::days(1),
            vec![Recipient::new("later@example.com")],
        );
        let id = job.id;
        store.insert(job);

        dispatcher(&store, Arc::new(RecordingMailer::default()))
            .run_once()
            .await;
        assert_eq!(store.get(id).unwrap().status, EmailJobStatus::Pending);
    }

    #[test]
    fn dispatcher_runs_unlocked_when_lease_store_is_down() {
        let config = dispatcher_config();
        assert_eq!(config.on_unavailable, OnUnavailable::ProceedUnlocked);
        assert_eq!(config.lease_key, LEASE_KEY);
        assert_eq!(config.batch_size, BATCH_SIZE);
    }
}
