//! # Periodic Timers
//!
//! The heartbeat keeper and the resync scheduler share one contract: while
//! running, invoke a tick callback every `period`; `start` on a running timer
//! replaces it instead of stacking a second one; `stop` is immediate and
//! idempotent. Each run is a spawned task guarded by a `CancellationToken`.

use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A restartable fixed-period timer.
pub struct PeriodicTask {
    name: &'static str,
    period: Duration,
    token: Option<CancellationToken>,
}

impl PeriodicTask {
    /// Creates a stopped timer. `name` is only used in log lines.
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period,
            token: None,
        }
    }

    /// Starts ticking, stopping any previous run first. The first tick fires
    /// one full `period` after the call.
    pub fn start<F>(&mut self, mut tick: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.stop();

        let token = CancellationToken::new();
        let child = token.clone();
        let period = self.period;
        let name = self.name;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = child.cancelled() => {
                        log::trace!("{} timer cancelled", name);
                        break;
                    }
                    _ = ticker.tick() => tick(),
                }
            }
        });

        log::debug!("{} timer started ({:?} period)", self.name, self.period);
        self.token = Some(token);
    }

    /// Stops ticking. Safe to call when not running.
    pub fn stop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
            log::debug!("{} timer stopped", self.name);
        }
    }

    /// Whether a run is currently active.
    pub fn is_running(&self) -> bool {
        self.token.is_some()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

/// Sends `heartbeat` frames while the channel is open.
pub struct HeartbeatKeeper {
    inner: PeriodicTask,
}

impl HeartbeatKeeper {
    /// Creates a stopped keeper with the given period.
    pub fn new(period: Duration) -> Self {
        Self {
            inner: PeriodicTask::new("heartbeat", period),
        }
    }

    /// (Re)starts the keeper; `beat` runs once per period.
    pub fn start<F>(&mut self, beat: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.inner.start(beat);
    }

    /// Stops the keeper.
    pub fn stop(&mut self) {
        self.inner.stop();
    }

    /// Whether the keeper is ticking.
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }
}

/// Re-requests the full presence snapshot on a long period.
pub struct ResyncScheduler {
    inner: PeriodicTask,
}

impl ResyncScheduler {
    /// Creates a stopped scheduler with the given period.
    pub fn new(period: Duration) -> Self {
        Self {
            inner: PeriodicTask::new("resync", period),
        }
    }

    /// (Re)starts the scheduler; `resync` runs once per period.
    pub fn start<F>(&mut self, resync: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.inner.start(resync);
    }

    /// Stops the scheduler.
    pub fn stop(&mut self) {
        self.inner.stop();
    }

    /// Whether the scheduler is ticking.
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }
}
