//! Fixed-interval ticker with an explicit stop signal.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};

/// Yields on a fixed period until stopped.
///
/// Missed ticks are skipped rather than bursted, so a slow scan never causes a
/// backlog of immediate re-runs.
#[derive(Debug)]
pub struct Ticker {
    interval: Interval,
    stop: watch::Receiver<bool>,
}

/// Cancels future ticks of the paired [`Ticker`]. Dropping it also stops the ticker.
#[derive(Debug)]
pub struct StopSignal {
    tx: watch::Sender<bool>,
}

impl StopSignal {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Shortest accepted period; a zero period is raised to this.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

impl Ticker {
    /// With `run_immediately` the first tick completes at once; otherwise after one period.
    pub fn new(period: Duration, run_immediately: bool) -> (Self, StopSignal) {
        let period = period.max(MIN_PERIOD);
        let mut interval = if run_immediately {
            interval(period)
        } else {
            interval_at(Instant::now() + period, period)
        };
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let (tx, rx) = watch::channel(false);
        (Self { interval, stop: rx }, StopSignal { tx })
    }

    /// Wait for the next tick. Returns `false` once stopped; a pending wait is cut short.
    pub async fn tick(&mut self) -> bool {
        if *self.stop.borrow() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.stop.changed() => false,
            _ = self.interval.tick() => !*self.stop.borrow(),
        }
    }
}
