use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

pub mod tasks;

/// Job scheduler for background tasks
pub struct JobScheduler {
    context: Arc<crate::context::AppContext>,
}

impl JobScheduler {
    pub fn new(context: Arc<crate::context::AppContext>) -> Self {
        Self { context }
    }

    /// Start all background jobs
    pub fn start(self: Arc<Self>) {
        info!("Starting background job scheduler");

        if self.context.snapshot.is_some() {
            tokio::spawn(Self::snapshot_refresh_job(Arc::clone(&self)));
        }

        // Spawn monitoring tasks
        tokio::spawn(Self::health_check_job(Arc::clone(&self)));

        info!("Background jobs started");
    }

    /// Rebuild the directory snapshot (runs every GAL_SNAPSHOT_REFRESH_SECS)
    async fn snapshot_refresh_job(scheduler: Arc<Self>) {
        let period = Duration::from_secs(scheduler.context.config.storage.snapshot_refresh_secs);
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Context construction already loaded the first snapshot
        interval.tick().await;

        loop {
            interval.tick().await;

            match tasks::refresh_snapshot(&scheduler.context).await {
                Ok(_) => {
                    // Outcome is logged by the snapshot itself
                }
                Err(e) => error!("Failed to refresh directory snapshot: {}", e),
            }
        }
    }

    /// Health check job (runs every 5 minutes)
    async fn health_check_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(300)); // Every 5 minutes

        loop {
            interval.tick().await;

            match tasks::health_check(&scheduler.context).await {
                Ok(_) => {
                    // Silent success - health is good
                }
                Err(e) => error!("Health check failed: {}", e),
            }
        }
    }
}
