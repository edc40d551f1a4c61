use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::controller::LifecycleController;
use vmfleet_core::config::RetentionGlobal;

/// Drives the controller on a fixed interval until told to stop.
pub struct RetentionScheduler {
    controller: Arc<LifecycleController>,
    interval: Duration,
    reconcile_every: u32,
}

impl RetentionScheduler {
    pub fn new(controller: Arc<LifecycleController>, settings: &RetentionGlobal) -> Self {
        Self {
            controller,
            interval: Duration::from_secs(settings.tick_interval_secs.max(1)),
            reconcile_every: settings.reconcile_every_ticks,
        }
    }

    /// Tick until `shutdown` turns true. Boots and shutdowns already
    /// dispatched keep running on their own tasks.
    ///
    /// Returns the number of ticks run.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;

        info!(
            interval_secs = self.interval.as_secs(),
            reconcile_every = self.reconcile_every,
            "Retention scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    ticks += 1;
                    if self.reconcile_every > 0 && ticks % u64::from(self.reconcile_every) == 0 {
                        self.controller.reconcile().await;
                    }
                    let report = self.controller.tick().await;
                    debug!(
                        tick = ticks,
                        launched = report.launched(),
                        reclaimed = report.reclaimed(),
                        "Scheduled tick"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(ticks, "Retention scheduler stopping");
                        break;
                    }
                }
            }
        }

        ticks
    }
}
