//! Single-flight deduplication of concurrent async operations.
//!
//! The first caller for a key installs a shared future; callers arriving while it
//! is live attach to it and observe the same `Ok` or `Err`. When the flight settles
//! the entry is removed, so the next caller starts fresh. Entries older than
//! `max_age` are treated as abandoned and replaced on access, and a background
//! sweep drops them in case nobody asks for that key again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::ticker::{StopSignal, Ticker};

type SharedResult<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

struct Flight<V, E> {
    generation: u64,
    started_at: Instant,
    future: SharedResult<V, E>,
}

/// Registry of in-flight operations keyed by string.
pub struct SingleFlightRegistry<V, E> {
    flights: Mutex<HashMap<String, Flight<V, E>>>,
    max_age: Duration,
    next_generation: AtomicU64,
}

impl<V, E> std::fmt::Debug for SingleFlightRegistry<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlightRegistry")
            .field("max_age", &self.max_age)
            .field("in_flight", &self.lock().len())
            .finish()
    }
}

impl<V, E> SingleFlightRegistry<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(max_age: Duration) -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
            max_age,
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Run `factory` for `key` unless a live flight exists, in which case attach to it.
    ///
    /// `factory` is only invoked by the caller that installs the flight.
    pub async fn run_exclusive<F, Fut>(&self, key: &str, factory: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (generation, future) = {
            let mut flights = self.lock();
            let now = Instant::now();
            let live = flights
                .get(key)
                .filter(|flight| now.duration_since(flight.started_at) < self.max_age)
                .map(|flight| (flight.generation, flight.future.clone()));

            match live {
                Some(attached) => {
                    debug!(key, "attaching to in-flight operation");
                    attached
                }
                None => {
                    if flights.contains_key(key) {
                        warn!(key, "replacing abandoned single-flight entry");
                    }
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let future = factory().boxed().shared();
                    flights.insert(
                        key.to_string(),
                        Flight {
                            generation,
                            started_at: now,
                            future: future.clone(),
                        },
                    );
                    (generation, future)
                }
            }
        };

        let result = future.await;

        // A newer flight may have replaced ours after it went stale; leave that one alone.
        let mut flights = self.lock();
        if flights
            .get(key)
            .is_some_and(|flight| flight.generation == generation)
        {
            flights.remove(key);
        }
        result
    }

    /// Drop entries older than `max_age`. Returns how many were removed.
    pub fn sweep_stale(&self) -> usize {
        let now = Instant::now();
        let mut flights = self.lock();
        let before = flights.len();
        flights.retain(|_, flight| now.duration_since(flight.started_at) < self.max_age);
        before - flights.len()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    /// Sweep on a fixed period until the handle is stopped or the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> SweeperHandle {
        let registry: Weak<Self> = Arc::downgrade(self);
        let (mut ticker, stop) = Ticker::new(every, false);

        let join = tokio::spawn(async move {
            while ticker.tick().await {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let removed = registry.sweep_stale();
                if removed > 0 {
                    warn!(removed, "swept abandoned single-flight entries");
                }
            }
        });

        SweeperHandle { stop, join }
    }
}

impl<V, E> SingleFlightRegistry<V, E> {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Flight<V, E>>> {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a background sweep task.
#[derive(Debug)]
pub struct SweeperHandle {
    stop: StopSignal,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop sweeping and wait for the task to exit.
    pub async fn stop(self) {
        self.stop.stop();
        if let Err(err) = self.join.await {
            warn!(error = %err, "single-flight sweeper task failed");
        }
    }
}
