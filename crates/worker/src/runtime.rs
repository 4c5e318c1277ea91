use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use cadence_coordination::jobs::{
    InMemoryMaintenanceJobStore, InMemorySessionStore, MaintenanceDispatchJob, MaintenanceMailer,
    NoopFinalizer, StaleSessionReaper, dispatcher_config, reaper_config,
};
use cadence_coordination::{
    ClaimableStore, CoordinatorHandle, DistributedLease, InMemoryKvStore, KeyValueStore,
    PeriodicCoordinator, RateLimitedGate, StopOutcome, SweeperHandle,
};
use cadence_core::{MaintenanceEmailJob, Session};
use cadence_infra::WorkerConfig;
use cadence_infra::db::{self, PgMaintenanceJobStore, PgSessionStore, PgTokenRepository};
use cadence_infra::external::geocoder::{Geocoder, GeocoderConfig};
use cadence_infra::external::tokens::{
    HttpTokenEndpoint, InMemoryTokenRepository, TokenRefresher, TokenRepository,
};
use cadence_infra::redis::RedisKvStore;

pub type JobStore = Arc<dyn ClaimableStore<Record = MaintenanceEmailJob>>;
pub type SessionStore = Arc<dyn ClaimableStore<Record = Session>>;

const TOKEN_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Storage the worker runs against.
pub struct Backends {
    pub kv: Arc<dyn KeyValueStore>,
    pub jobs: JobStore,
    pub sessions: SessionStore,
    pub tokens: Arc<dyn TokenRepository>,
}

impl Backends {
    /// Process-local stores; state is lost on exit.
    pub fn in_memory() -> Self {
        Self {
            kv: InMemoryKvStore::arc(),
            jobs: InMemoryMaintenanceJobStore::arc(),
            sessions: InMemorySessionStore::arc(),
            tokens: Arc::new(InMemoryTokenRepository::new()),
        }
    }

    /// Postgres and Redis when configured, in-memory stand-ins otherwise.
    pub async fn connect(config: &WorkerConfig) -> anyhow::Result<Self> {
        let mut backends = Self::in_memory();

        if let Some(url) = &config.redis_url {
            let redis = RedisKvStore::connect(url)
                .await
                .context("failed to connect to redis")?;
            backends.kv = Arc::new(redis);
            info!("using redis for leases and the durable cache tier");
        }

        if let Some(url) = &config.database_url {
            let pool = db::connect(url)
                .await
                .context("failed to connect to postgres")?;
            backends.jobs = Arc::new(PgMaintenanceJobStore::new(pool.clone()));
            backends.sessions = Arc::new(PgSessionStore::new(pool.clone()));
            backends.tokens = Arc::new(PgTokenRepository::new(pool));
            info!("using postgres for jobs, sessions and tokens");
        }

        Ok(backends)
    }
}

/// Both coordinators plus the services they share.
pub struct Worker {
    dispatcher: PeriodicCoordinator<MaintenanceDispatchJob<JobStore>>,
    reaper: PeriodicCoordinator<StaleSessionReaper<SessionStore>>,
    geocoder: Arc<Geocoder>,
    tokens: Option<Arc<TokenRefresher>>,
}

impl Worker {
    pub fn build(
        config: &WorkerConfig,
        backends: Backends,
        mailer: Arc<dyn MaintenanceMailer>,
    ) -> anyhow::Result<Self> {
        let gate = Arc::new(RateLimitedGate::new(config.geocoder.min_interval));
        let cache = Arc::new(Geocoder::build_cache(
            config.geocoder.cache_capacity,
            Some(Arc::clone(&backends.kv)),
        ));
        let geocoder = Arc::new(
            Geocoder::new(GeocoderConfig::from_settings(&config.geocoder), gate, cache)
                .context("failed to build geocoder client")?,
        );

        let lease = DistributedLease::new(Arc::clone(&backends.kv));
        let dispatcher = PeriodicCoordinator::new(
            MaintenanceDispatchJob::new(backends.jobs, mailer).with_place_lookup(geocoder.clone()),
            lease.clone(),
            dispatcher_config().with_interval(config.email_dispatch_interval),
        );
        let reaper = PeriodicCoordinator::new(
            StaleSessionReaper::new(
                backends.sessions,
                Arc::new(NoopFinalizer),
                config.session_idle_timeout,
            ),
            lease,
            reaper_config().with_interval(config.session_reap_interval),
        );

        let tokens = match &config.token_endpoint {
            Some(settings) => {
                let endpoint = HttpTokenEndpoint::new(settings.clone())
                    .context("failed to build token endpoint client")?;
                Some(Arc::new(TokenRefresher::new(
                    backends.tokens,
                    Arc::new(endpoint),
                )))
            }
            None => {
                info!("TOKEN_ENDPOINT_URL not set; token refresh disabled");
                None
            }
        };

        Ok(Self {
            dispatcher,
            reaper,
            geocoder,
            tokens,
        })
    }

    pub fn dispatcher(&self) -> &PeriodicCoordinator<MaintenanceDispatchJob<JobStore>> {
        &self.dispatcher
    }

    pub fn reaper(&self) -> &PeriodicCoordinator<StaleSessionReaper<SessionStore>> {
        &self.reaper
    }

    pub fn geocoder(&self) -> &Arc<Geocoder> {
        &self.geocoder
    }

    pub fn token_refresher(&self) -> Option<&Arc<TokenRefresher>> {
        self.tokens.as_ref()
    }

    pub fn start(&self) -> RunningWorker {
        RunningWorker {
            dispatcher: self.dispatcher.start(),
            reaper: self.reaper.start(),
            token_sweeper: self
                .tokens
                .as_ref()
                .map(|tokens| tokens.spawn_sweeper(TOKEN_SWEEP_INTERVAL)),
        }
    }
}

#[derive(Debug)]
pub struct RunningWorker {
    dispatcher: CoordinatorHandle,
    reaper: CoordinatorHandle,
    token_sweeper: Option<SweeperHandle>,
}

impl RunningWorker {
    /// Stop both coordinators (bounded drain) and the token sweeper.
    /// Returns `false` if any coordinator had to be abandoned mid-scan.
    pub async fn shutdown(self) -> bool {
        let (dispatcher, reaper) = tokio::join!(self.dispatcher.stop(), self.reaper.stop());
        if let Some(sweeper) = self.token_sweeper {
            sweeper.stop().await;
        }

        let drained = dispatcher == StopOutcome::Drained && reaper == StopOutcome::Drained;
        if !drained {
            warn!(?dispatcher, ?reaper, "worker stopped with work still in flight");
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_coordination::ScanReport;
    use cadence_core::{AccountId, EmailJobStatus, Recipient, SessionStatus};
    use cadence_infra::config::TokenEndpointSettings;
    use chrono::Utc;

    use crate::LoggingMailer;

    fn config() -> WorkerConfig {
        WorkerConfig::from_lookup(|_| None).unwrap()
    }

    #[tokio::test]
    async fn dispatches_due_jobs_against_in_memory_backends() {
        let jobs = InMemoryMaintenanceJobStore::arc();
        let job = MaintenanceEmailJob::new(
            AccountId::new(),
            "chain-service",
            Utc::now() - chrono::Duration::minutes(1),
            vec![Recipient::new("rider@example.com").with_bike("Commuter")],
        );
        jobs.insert(job.clone());

        let backends = Backends {
            jobs: jobs.clone(),
            ..Backends::in_memory()
        };
        let worker = Worker::build(&config(), backends, Arc::new(LoggingMailer)).unwrap();

        let ScanReport::Completed(summary) = worker.dispatcher().run_once().await else {
            panic!("dispatcher scan did not complete");
        };
        assert_eq!(summary.completed, 1);

        let stored = jobs.get(job.id).unwrap();
        assert_eq!(stored.status, EmailJobStatus::Sent);
        assert_eq!(stored.sent_count, 1);
    }

    #[tokio::test]
    async fn reaps_idle_sessions_against_in_memory_backends() {
        let sessions = InMemorySessionStore::arc();
        let idle = Session::new(AccountId::new(), Utc::now() - chrono::Duration::hours(2));
        let fresh = Session::new(AccountId::new(), Utc::now());
        sessions.insert(idle.clone());
        sessions.insert(fresh.clone());

        let backends = Backends {
            sessions: sessions.clone(),
            ..Backends::in_memory()
        };
        let worker = Worker::build(&config(), backends, Arc::new(LoggingMailer)).unwrap();
        worker.reaper().run_once().await;

        assert_eq!(sessions.get(idle.id).unwrap().status, SessionStatus::Expired);
        assert_eq!(sessions.get(fresh.id).unwrap().status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn uses_configured_intervals() {
        let config = WorkerConfig::from_lookup(|key| match key {
            "EMAIL_DISPATCH_INTERVAL_SECS" => Some("15".into()),
            "SESSION_REAP_INTERVAL_SECS" => Some("5".into()),
            _ => None,
        })
        .unwrap();
        let worker =
            Worker::build(&config, Backends::in_memory(), Arc::new(LoggingMailer)).unwrap();

        assert_eq!(worker.dispatcher().config().interval, Duration::from_secs(15));
        assert_eq!(worker.reaper().config().interval, Duration::from_secs(5));
        assert!(worker.token_refresher().is_none());
    }

    #[tokio::test]
    async fn builds_token_refresher_when_endpoint_configured() {
        let mut config = config();
        config.token_endpoint = Some(TokenEndpointSettings {
            url: "http://127.0.0.1:9/oauth/token".into(),
            client_id: "cadence".into(),
            client_secret: "secret".into(),
        });
        let worker =
            Worker::build(&config, Backends::in_memory(), Arc::new(LoggingMailer)).unwrap();
        assert!(worker.token_refresher().is_some());
    }

    #[tokio::test]
    async fn start_then_shutdown_drains() {
        let worker =
            Worker::build(&config(), Backends::in_memory(), Arc::new(LoggingMailer)).unwrap();
        let running = worker.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(running.shutdown().await);
    }
}
