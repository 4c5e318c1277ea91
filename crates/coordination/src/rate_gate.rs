//! Minimum-interval gate for a throttled upstream API.
//!
//! Callers queue on a FIFO-fair async mutex. The holder waits out whatever remains
//! of `min_interval` since the previous permitted start, records its own start and
//! releases the next waiter. The lock is held for at most `min_interval`.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Serializes and spaces out calls so no two permitted starts are closer than
/// `min_interval`. Waiters are granted in arrival order.
#[derive(Debug)]
pub struct RateLimitedGate {
    last_permitted: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimitedGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_permitted: Mutex::new(None),
            min_interval,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Suspend until this caller may start its call.
    pub async fn acquire_slot(&self) {
        let mut last = self.last_permitted.lock().await;
        if let Some(previous) = *last {
            let earliest = previous + self.min_interval;
            if earliest > Instant::now() {
                sleep_until(earliest).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Acquire a slot, then run `call`. The call itself runs outside the gate's lock.
    pub async fn run<F, Fut, T>(&self, call: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire_slot().await;
        call().await
    }
}
