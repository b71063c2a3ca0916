use super::reconcile::PaymentReconciler;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Background task that periodically re-drives unfinished payment notifications.
pub struct RetrySweeper {
    reconciler: Arc<PaymentReconciler>,
    interval: Duration,
}

impl RetrySweeper {
    pub fn new(reconciler: Arc<PaymentReconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
        }
    }

    /// Sweeps once per interval until `shutdown` fires. The first sweep runs
    /// immediately. Returns the number of sweeps performed.
    pub async fn run(self, shutdown: CancellationToken) -> usize {
        info!(interval_secs = self.interval.as_secs(), "Retry sweeper starting");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweeps = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    sweeps += 1;
                    if let Err(e) = self.reconciler.sweep_once().await {
                        error!(error = %e, "Payment retry sweep failed");
                    }
                }
            }
        }

        info!(sweeps, "Retry sweeper stopped");
        sweeps
    }
}
