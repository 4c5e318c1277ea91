//! Periodic, overlap-safe scan loop: lease, select, claim, execute, terminal write.
//!
//! One run walks `Idle -> LockAttempt -> Scanning -> ClaimAttempt -> Executing ->
//! TerminalWrite -> LockRelease -> Idle`, bailing out early when another instance
//! holds the lease or this instance is still busy with the previous tick.
//!
//! Failure handling inside a run:
//! - a lost claim is an expected race (`debug`)
//! - a failing or panicking unit of work still gets a terminal write (`warn`)
//! - a failing terminal write is logged (`error`) and the scan continues
//! - a failing batch query aborts the scan; the lease is released regardless

use std::any::Any;
use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::claim::{ClaimRecord, ClaimableStore};
use crate::error::{JobError, StoreError};
use crate::lease::{DistributedLease, LeaseAttempt, OnUnavailable};
use crate::ticker::{StopSignal, Ticker};

pub type RecordOf<J> = <<J as ScanJob>::Store as ClaimableStore>::Record;
pub type RecordIdOf<J> = <RecordOf<J> as ClaimRecord>::Id;
pub type TerminalOf<J> = <RecordOf<J> as ClaimRecord>::Terminal;

/// The job-specific half of a coordinator: where candidates come from and what to
/// do with a claimed record.
#[async_trait]
pub trait ScanJob: Send + Sync + 'static {
    type Store: ClaimableStore;

    fn store(&self) -> &Self::Store;

    /// Latest `due_at` a candidate may have at `now`.
    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now
    }

    /// Process a claimed record and produce its terminal state.
    async fn execute(
        &self,
        record: &<Self::Store as ClaimableStore>::Record,
    ) -> Result<<<Self::Store as ClaimableStore>::Record as ClaimRecord>::Terminal, JobError>;

    /// Terminal state for a record whose unit of work failed or panicked.
    fn failure_terminal(
        &self,
        record: &<Self::Store as ClaimableStore>::Record,
        error: &JobError,
    ) -> <<Self::Store as ClaimableStore>::Record as ClaimRecord>::Terminal;
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Name for logging
    pub name: String,
    pub interval: Duration,
    pub batch_size: usize,
    pub lease_key: String,
    pub lease_ttl: Duration,
    /// What to do when the lease store is unreachable
    pub on_unavailable: OnUnavailable,
    /// Scan once at startup instead of waiting a full interval
    pub run_immediately: bool,
    pub shutdown_poll_interval: Duration,
    pub shutdown_max_wait: Duration,
}

impl CoordinatorConfig {
    /// The unavailability policy has no default; every coordinator states it.
    pub fn new(
        name: impl Into<String>,
        lease_key: impl Into<String>,
        on_unavailable: OnUnavailable,
    ) -> Self {
        Self {
            name: name.into(),
            interval: Duration::from_secs(60),
            batch_size: 10,
            lease_key: lease_key.into(),
            lease_ttl: Duration::from_secs(5 * 60),
            on_unavailable,
            run_immediately: true,
            shutdown_poll_interval: Duration::from_millis(100),
            shutdown_max_wait: Duration::from_secs(30),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_run_immediately(mut self, run_immediately: bool) -> Self {
        self.run_immediately = run_immediately;
        self
    }

    pub fn with_shutdown(mut self, poll_interval: Duration, max_wait: Duration) -> Self {
        self.shutdown_poll_interval = poll_interval;
        self.shutdown_max_wait = max_wait;
        self
    }
}

/// Counters for one completed scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub candidates: usize,
    pub claimed: usize,
    /// Claims won by another runner.
    pub lost_races: usize,
    /// Units of work that returned a terminal state.
    pub completed: usize,
    /// Units of work that failed or panicked (still written as terminal).
    pub failed: usize,
    /// Claimed records that were gone by the time of the terminal write.
    pub vanished: usize,
    /// Store errors on claim or terminal write.
    pub store_errors: usize,
    /// The scan ran without the lease (store unavailable, `ProceedUnlocked`).
    pub unlocked: bool,
}

/// Outcome of one `run_once`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanReport {
    /// The previous scan on this instance is still running.
    SkippedBusy,
    /// Another instance holds the lease.
    SkippedLeaseHeld,
    /// Lease store unreachable and the policy is `Skip`.
    SkippedLeaseUnavailable,
    Completed(ScanSummary),
    /// The batch query failed or the scan panicked.
    Aborted(String),
}

/// Result of [`CoordinatorHandle::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// In-flight work (if any) finished within the bounded wait.
    Drained,
    /// Work was still running after the bounded wait; it was left to finish on its own.
    TimedOut,
}

struct Inner<J> {
    job: J,
    lease: DistributedLease,
    config: CoordinatorConfig,
    processing: AtomicBool,
}

/// Generic periodic coordinator. Cheap to clone.
pub struct PeriodicCoordinator<J> {
    inner: Arc<Inner<J>>,
}

impl<J> Clone for PeriodicCoordinator<J> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<J> Debug for PeriodicCoordinator<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicCoordinator")
            .field("config", &self.inner.config)
            .field("processing", &self.inner.processing.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Clears the process-local busy flag when a run ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn try_enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<J: ScanJob> PeriodicCoordinator<J> {
    pub fn new(job: J, lease: DistributedLease, config: CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                job,
                lease,
                config,
                processing: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn job(&self) -> &J {
        &self.inner.job
    }

    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::SeqCst)
    }

    /// Run a single scan. Never fails; every outcome is reported.
    pub async fn run_once(&self) -> ScanReport {
        let config = &self.inner.config;
        let Some(_busy) = BusyGuard::try_enter(&self.inner.processing) else {
            debug!(coordinator = %config.name, "previous scan still running; skipping tick");
            return ScanReport::SkippedBusy;
        };

        let lease = match self
            .inner
            .lease
            .acquire(&config.lease_key, config.lease_ttl, config.on_unavailable)
            .await
        {
            LeaseAttempt::Acquired(lease) => Some(lease),
            LeaseAttempt::ProceedUnlocked => None,
            LeaseAttempt::Held => return ScanReport::SkippedLeaseHeld,
            LeaseAttempt::Skipped => return ScanReport::SkippedLeaseUnavailable,
        };

        let scan = AssertUnwindSafe(self.scan(lease.is_none()))
            .catch_unwind()
            .await;

        if let Some(lease) = &lease {
            self.inner.lease.release(lease).await;
        }

        match scan {
            Ok(Ok(summary)) => {
                if summary.claimed > 0 {
                    info!(
                        coordinator = %config.name,
                        candidates = summary.candidates,
                        claimed = summary.claimed,
                        completed = summary.completed,
                        failed = summary.failed,
                        unlocked = summary.unlocked,
                        "scan finished"
                    );
                } else {
                    debug!(coordinator = %config.name, candidates = summary.candidates, "scan finished");
                }
                ScanReport::Completed(summary)
            }
            Ok(Err(err)) => {
                warn!(coordinator = %config.name, error = %err, "scan aborted");
                ScanReport::Aborted(err.to_string())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(coordinator = %config.name, panic = %message, "scan panicked");
                ScanReport::Aborted(message)
            }
        }
    }

    async fn scan(&self, unlocked: bool) -> Result<ScanSummary, StoreError> {
        let job = &self.inner.job;
        let cutoff = job.cutoff(Utc::now());
        let ids = job
            .store()
            .select_due(cutoff, self.inner.config.batch_size)
            .await?;

        let mut summary = ScanSummary {
            candidates: ids.len(),
            unlocked,
            ..ScanSummary::default()
        };
        for id in ids {
            self.process_candidate(id, cutoff, &mut summary).await;
        }
        Ok(summary)
    }

    async fn process_candidate(
        &self,
        id: RecordIdOf<J>,
        cutoff: DateTime<Utc>,
        summary: &mut ScanSummary,
    ) {
        let name = &self.inner.config.name;
        let job = &self.inner.job;
        let store = job.store();

        let record = match store.claim(id, cutoff).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(coordinator = %name, record_id = %id, "claim lost to another runner or no longer due");
                summary.lost_races += 1;
                return;
            }
            Err(err) => {
                warn!(coordinator = %name, record_id = %id, error = %err, "claim failed");
                summary.store_errors += 1;
                return;
            }
        };
        summary.claimed += 1;

        let outcome = AssertUnwindSafe(job.execute(&record)).catch_unwind().await;
        let terminal = match outcome {
            Ok(Ok(terminal)) => {
                summary.completed += 1;
                terminal
            }
            Ok(Err(err)) => {
                warn!(coordinator = %name, record_id = %id, error = %err, "unit of work failed");
                summary.failed += 1;
                job.failure_terminal(&record, &err)
            }
            Err(payload) => {
                let err = JobError::Panicked(panic_message(payload.as_ref()));
                warn!(coordinator = %name, record_id = %id, error = %err, "unit of work panicked");
                summary.failed += 1;
                job.failure_terminal(&record, &err)
            }
        };

        match store.finish(id, &terminal).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(coordinator = %name, record_id = %id, "record vanished before terminal write");
                summary.vanished += 1;
            }
            Err(err) => {
                error!(
                    coordinator = %name,
                    record_id = %id,
                    error = %err,
                    "terminal write failed; record left in processing"
                );
                summary.store_errors += 1;
            }
        }
    }

    /// Spawn the scan loop on the current runtime.
    pub fn start(&self) -> CoordinatorHandle {
        let config = &self.inner.config;
        let (mut ticker, stop) = Ticker::new(config.interval, config.run_immediately);
        let coordinator = self.clone();
        let name = config.name.clone();

        info!(
            coordinator = %name,
            interval_secs = config.interval.as_secs_f64(),
            batch_size = config.batch_size,
            "coordinator started"
        );

        let loop_name = name.clone();
        let join = tokio::spawn(async move {
            while ticker.tick().await {
                coordinator.run_once().await;
            }
            debug!(coordinator = %loop_name, "scan loop exited");
        });

        let processing: Arc<dyn Fn() -> bool + Send + Sync> = {
            let coordinator = self.clone();
            Arc::new(move || coordinator.is_processing())
        };

        CoordinatorHandle {
            name,
            stop,
            join,
            processing,
            poll_interval: config.shutdown_poll_interval,
            max_wait: config.shutdown_max_wait,
        }
    }
}

/// Handle to a running coordinator loop.
pub struct CoordinatorHandle {
    name: String,
    stop: StopSignal,
    join: JoinHandle<()>,
    processing: Arc<dyn Fn() -> bool + Send + Sync>,
    poll_interval: Duration,
    max_wait: Duration,
}

impl Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("name", &self.name)
            .field("stopped", &self.stop.is_stopped())
            .finish_non_exhaustive()
    }
}

impl CoordinatorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop ticking at once, then wait (bounded) for an in-flight scan to finish.
    ///
    /// In-flight work is never cancelled; on timeout it is left running.
    pub async fn stop(self) -> StopOutcome {
        self.stop.stop();
        let deadline = Instant::now() + self.max_wait;

        while (self.processing)() {
            if Instant::now() >= deadline {
                warn!(
                    coordinator = %self.name,
                    max_wait_secs = self.max_wait.as_secs_f64(),
                    "forced stop: scan still running after max wait"
                );
                return StopOutcome::TimedOut;
            }
            sleep(self.poll_interval).await;
        }

        // A tick that fired just before the stop may still be entering its scan.
        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .max(self.poll_interval);
        match timeout(remaining, self.join).await {
            Ok(Ok(())) => {
                info!(coordinator = %self.name, "coordinator stopped");
                StopOutcome::Drained
            }
            Ok(Err(err)) => {
                error!(coordinator = %self.name, error = %err, "coordinator task failed");
                StopOutcome::Drained
            }
            Err(_) => {
                warn!(coordinator = %self.name, "forced stop: scan loop did not exit in time");
                StopOutcome::TimedOut
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::InMemoryClaimStore;
    use crate::claim::test_support::{Task, TaskState};
    use crate::kv::{InMemoryKvStore, KeyValueStore};
    use std::sync::Mutex;

    const LEASE_KEY: &str = "lease:test-scan";

    #[derive(Debug, Clone, Copy)]
    enum Mode {
        Succeed,
        FailOn(u32),
        PanicOn(u32),
        DeleteDuring,
        Sleep(Duration),
    }

    struct TestJob {
        store: Arc<InMemoryClaimStore<Task>>,
        mode: Mode,
        executed: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl ScanJob for TestJob {
        type Store = Arc<InMemoryClaimStore<Task>>;

        fn store(&self) -> &Self::Store {
            &self.store
        }

        async fn execute(&self, record: &Task) -> Result<(TaskState, Option<String>), JobError> {
            self.executed.lock().unwrap().push(record.id);
            match self.mode {
                Mode::Succeed => {}
                Mode::FailOn(id) if id == record.id => {
                    return Err(JobError::upstream("mailer rejected"));
                }
                Mode::PanicOn(id) if id == record.id => panic!("boom"),
                Mode::FailOn(_) | Mode::PanicOn(_) => {}
                Mode::DeleteDuring => {
                    self.store.remove(record.id);
                }
                Mode::Sleep(duration) => sleep(duration).await,
            }
            Ok((TaskState::Done, None))
        }

        fn failure_terminal(&self, _record: &Task, error: &JobError) -> (TaskState, Option<String>) {
            (TaskState::Failed, Some(error.to_string()))
        }
    }

    struct Fixture {
        kv: Arc<InMemoryKvStore>,
        store: Arc<InMemoryClaimStore<Task>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                kv: InMemoryKvStore::arc(),
                store: InMemoryClaimStore::arc(),
            }
        }

        fn seed_due(&self, ids: &[u32]) {
            let now = Utc::now();
            for (offset, id) in ids.iter().enumerate() {
                let due = now - chrono::Duration::minutes(10 - offset as i64);
                self.store.insert(Task::pending(*id, due));
            }
        }

        fn coordinator(&self, mode: Mode, policy: OnUnavailable) -> PeriodicCoordinator<TestJob> {
            self.coordinator_with(mode, CoordinatorConfig::new("test", LEASE_KEY, policy))
        }

        fn coordinator_with(
            &self,
            mode: Mode,
            config: CoordinatorConfig,
        ) -> PeriodicCoordinator<TestJob> {
            let job = TestJob {
                store: self.store.clone(),
                mode,
                executed: Arc::new(Mutex::new(Vec::new())),
            };
            PeriodicCoordinator::new(job, DistributedLease::new(self.kv.clone()), config)
        }

        fn state(&self, id: u32) -> TaskState {
            self.store.get(id).unwrap().state
        }
    }

    fn summary(report: ScanReport) -> ScanSummary {
        match report {
            ScanReport::Completed(summary) => summary,
            other => panic!("expected a completed scan, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn processes_due_records_earliest_first() {
        let fx = Fixture::new();
        fx.seed_due(&[3, 1, 2]);
        fx.store
            .insert(Task::pending(9, Utc::now() + chrono::Duration::hours(1)));
        let coordinator = fx.coordinator(Mode::Succeed, OnUnavailable::Skip);

        let summary = summary(coordinator.run_once().await);
        assert_eq!(summary.candidates, 3);
        assert_eq!(summary.claimed, 3);
        assert_eq!(summary.completed, 3);
        assert!(!summary.unlocked);

        assert_eq!(*coordinator.job().executed.lock().unwrap(), vec![3, 1, 2]);
        for id in [1, 2, 3] {
            assert_eq!(fx.state(id), TaskState::Done);
        }
        assert_eq!(fx.state(9), TaskState::Pending);
        assert!(fx.kv.get(LEASE_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_size_bounds_each_scan() {
        let fx = Fixture::new();
        fx.seed_due(&[1, 2, 3, 4, 5]);
        let config =
            CoordinatorConfig::new("test", LEASE_KEY, OnUnavailable::Skip).with_batch_size(2);
        let coordinator = fx.coordinator_with(Mode::Succeed, config);

        assert_eq!(summary(coordinator.run_once().await).claimed, 2);
        assert_eq!(summary(coordinator.run_once().await).claimed, 2);
        assert_eq!(summary(coordinator.run_once().await).claimed, 1);
        assert_eq!(summary(coordinator.run_once().await).candidates, 0);
    }

    #[tokio::test]
    async fn one_failing_candidate_does_not_abort_the_scan() {
        let fx = Fixture::new();
        fx.seed_due(&[1, 2, 3]);
        let coordinator = fx.coordinator(Mode::FailOn(2), OnUnavailable::Skip);

        let summary = summary(coordinator.run_once().await);
        assert_eq!((summary.completed, summary.failed), (2, 1));

        let failed = fx.store.get(2).unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert!(failed.note.unwrap().contains("mailer rejected"));
        assert_eq!(fx.state(3), TaskState::Done);
    }

    #[tokio::test]
    async fn panicking_unit_still_ends_terminal() {
        let fx = Fixture::new();
        fx.seed_due(&[1, 2]);
        let coordinator = fx.coordinator(Mode::PanicOn(1), OnUnavailable::Skip);

        let summary = summary(coordinator.run_once().await);
        assert_eq!(summary.failed, 1);

        let panicked = fx.store.get(1).unwrap();
        assert_eq!(panicked.state, TaskState::Failed);
        assert!(panicked.note.unwrap().contains("boom"));
        assert_eq!(fx.state(2), TaskState::Done);
        assert!(!coordinator.is_processing());
        assert!(fx.kv.get(LEASE_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_deleted_before_terminal_write_is_tolerated() {
        let fx = Fixture::new();
        fx.seed_due(&[1]);
        let coordinator = fx.coordinator(Mode::DeleteDuring, OnUnavailable::Skip);

        let summary = summary(coordinator.run_once().await);
        assert_eq!(summary.vanished, 1);
        assert!(fx.store.get(1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn two_coordinators_ticking_together_one_skips() {
        let fx = Fixture::new();
        fx.seed_due(&[1, 2]);
        let a = fx.coordinator(Mode::Sleep(Duration::from_secs(1)), OnUnavailable::Skip);
        let b = fx.coordinator(Mode::Sleep(Duration::from_secs(1)), OnUnavailable::Skip);

        let (ra, rb) = tokio::join!(a.run_once(), b.run_once());
        let reports = [ra, rb];
        assert_eq!(
            reports
                .iter()
                .filter(|r| matches!(r, ScanReport::Completed(_)))
                .count(),
            1
        );
        assert!(reports.contains(&ScanReport::SkippedLeaseHeld));
        assert_eq!(fx.state(1), TaskState::Done);
        assert_eq!(fx.state(2), TaskState::Done);
    }

    #[tokio::test]
    async fn claims_protect_unlocked_scans() {
        let fx = Fixture::new();
        fx.seed_due(&[1, 2, 3]);
        fx.kv.set_unavailable(true);
        let a = fx.coordinator(Mode::Succeed, OnUnavailable::ProceedUnlocked);
        let b = fx.coordinator(Mode::Succeed, OnUnavailable::ProceedUnlocked);

        let (ra, rb) = tokio::join!(a.run_once(), b.run_once());
        let (sa, sb) = (summary(ra), summary(rb));
        assert!(sa.unlocked && sb.unlocked);
        assert_eq!(sa.claimed + sb.claimed, 3);

        let mut executed = a.job().executed.lock().unwrap().clone();
        executed.extend(b.job().executed.lock().unwrap().iter());
        executed.sort_unstable();
        assert_eq!(executed, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn skip_policy_leaves_records_untouched() {
        let fx = Fixture::new();
        fx.seed_due(&[1]);
        fx.kv.set_unavailable(true);
        let coordinator = fx.coordinator(Mode::Succeed, OnUnavailable::Skip);

        assert_eq!(
            coordinator.run_once().await,
            ScanReport::SkippedLeaseUnavailable
        );
        assert_eq!(fx.state(1), TaskState::Pending);
    }

    #[tokio::test]
    async fn failing_batch_query_aborts_and_releases_lease() {
        let fx = Fixture::new();
        fx.seed_due(&[1]);
        fx.store.set_unavailable(true);
        let coordinator = fx.coordinator(Mode::Succeed, OnUnavailable::Skip);

        assert!(matches!(
            coordinator.run_once().await,
            ScanReport::Aborted(_)
        ));
        assert!(fx.kv.get(LEASE_KEY).await.unwrap().is_none());
        assert!(!coordinator.is_processing());
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_runs_on_one_instance_are_refused() {
        let fx = Fixture::new();
        fx.seed_due(&[1]);
        let coordinator = fx.coordinator(Mode::Sleep(Duration::from_secs(5)), OnUnavailable::Skip);

        let (first, second) = tokio::join!(coordinator.run_once(), coordinator.run_once());
        assert!(matches!(first, ScanReport::Completed(_)));
        assert_eq!(second, ScanReport::SkippedBusy);
    }

    #[tokio::test(start_paused = true)]
    async fn start_scans_immediately_then_on_interval() {
        let fx = Fixture::new();
        fx.seed_due(&[1]);
        let config = CoordinatorConfig::new("test", LEASE_KEY, OnUnavailable::Skip)
            .with_interval(Duration::from_secs(30));
        let handle = fx.coordinator_with(Mode::Succeed, config).start();

        sleep(Duration::from_millis(10)).await;
        assert_eq!(fx.state(1), TaskState::Done);

        fx.seed_due(&[2]);
        sleep(Duration::from_secs(30)).await;
        assert_eq!(fx.state(2), TaskState::Done);

        assert_eq!(handle.stop().await, StopOutcome::Drained);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_still_starts_and_stops() {
        let fx = Fixture::new();
        fx.seed_due(&[1]);
        let config = CoordinatorConfig::new("test", LEASE_KEY, OnUnavailable::Skip)
            .with_interval(Duration::ZERO);
        let handle = fx.coordinator_with(Mode::Succeed, config).start();

        sleep(Duration::from_millis(10)).await;
        assert_eq!(fx.state(1), TaskState::Done);
        assert_eq!(handle.stop().await, StopOutcome::Drained);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_in_flight_unit() {
        let fx = Fixture::new();
        fx.seed_due(&[1]);
        let handle = fx
            .coordinator(Mode::Sleep(Duration::from_secs(5)), OnUnavailable::Skip)
            .start();

        sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.state(1), TaskState::Processing);

        let started = Instant::now();
        assert_eq!(handle.stop().await, StopOutcome::Drained);
        assert!(Instant::now() - started < Duration::from_secs(6));
        assert_eq!(fx.state(1), TaskState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_gives_up_after_max_wait() {
        let fx = Fixture::new();
        fx.seed_due(&[1]);
        let config = CoordinatorConfig::new("test", LEASE_KEY, OnUnavailable::Skip)
            .with_shutdown(Duration::from_millis(100), Duration::from_secs(2));
        let handle = fx
            .coordinator_with(Mode::Sleep(Duration::from_secs(60)), config)
            .start();

        sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        assert_eq!(handle.stop().await, StopOutcome::TimedOut);
        assert!(Instant::now() - started < Duration::from_secs(3));
        assert_eq!(fx.state(1), TaskState::Processing);
    }
}
