use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

use super::engine::EngagementEngine;

/// Background task that periodically auto-approves engagements whose
/// confirmation deadline has passed.
pub struct Sweeper {
    engine: Arc<EngagementEngine>,
    period: Duration,
}

impl Sweeper {
    pub fn new(engine: Arc<EngagementEngine>, period: Duration) -> Self {
        Self { engine, period }
    }

    /// One pass. Failures are logged and reported as zero promotions.
    pub async fn run_once(&self) -> usize {
        match self.engine.sweep_timeouts().await {
            Ok(promoted) => promoted,
            Err(e) => {
                error!(error = %e, "Sweep failed");
                0
            }
        }
    }

    /// Runs until `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_secs = self.period.as_secs(), "Sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let promoted = self.run_once().await;
                        debug!(promoted, "Sweep tick");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Sweeper stopped");
        })
    }
}
