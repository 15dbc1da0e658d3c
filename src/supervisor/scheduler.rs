//! Auto-restart scheduler
//!
//! Wakes on a fixed tick and restarts every running server whose
//! auto-restart interval has elapsed since its last start.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::{StartOutcome, Supervisor};

pub const DEFAULT_TICK: Duration = Duration::from_secs(5);

pub struct AutoRestartScheduler {
    supervisor: Arc<Supervisor>,
    tick: Duration,
}

impl AutoRestartScheduler {
    pub fn new(supervisor: Arc<Supervisor>, tick: Duration) -> Self {
        Self {
            supervisor,
            tick: tick.max(Duration::from_millis(10)),
        }
    }

    /// Tick until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("Auto-restart scheduler started (tick {:?})", self.tick);
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick_at(Instant::now()).await;
                }
            }
        }
        tracing::info!("Auto-restart scheduler stopped");
    }

    /// One scheduler pass as of `now`. Returns the ids that were restarted.
    ///
    /// Due servers are snapshotted first; each one is then re-checked and
    /// restarted on its own, so one slow termination does not block the
    /// registry for the others.
    pub async fn tick_at(&self, now: Instant) -> Vec<String> {
        let due = self.supervisor.due_for_restart(now).await;
        let mut restarted = Vec::with_capacity(due.len());

        for id in due {
            match self.supervisor.auto_restart(&id, now).await {
                Ok(Some(StartOutcome::SpawnFailed { reason })) => {
                    tracing::warn!("Auto-restart of '{}' failed to spawn: {}", id, reason);
                    restarted.push(id);
                }
                Ok(Some(_)) => restarted.push(id),
                Ok(None) => tracing::debug!("'{}' no longer due for restart", id),
                Err(e) => tracing::warn!("Auto-restart of '{}' failed: {}", id, e),
            }
        }
        restarted
    }
}
