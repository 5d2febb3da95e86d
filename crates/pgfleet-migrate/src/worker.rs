//! Background worker that drains the migration queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::coordinator::MigrationCoordinator;
use crate::error::{MigrationError, MigrationResult};

/// Claims running migration jobs (new, or abandoned by a dead worker)
/// and drives each to a terminal state.
pub struct MigrationWorker {
    coordinator: Arc<MigrationCoordinator>,
    interval: Duration,
}

impl MigrationWorker {
    pub fn new(coordinator: Arc<MigrationCoordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
        }
    }

    /// Run every claimable job once. Returns how many jobs were picked up.
    ///
    /// No new job is claimed once `shutdown` has fired. A migration already
    /// running is finished (or rolled back) rather than abandoned, since
    /// abandoning it could leave the tenant's writes paused.
    pub async fn poll_once(&self, shutdown: &watch::Receiver<bool>) -> MigrationResult<usize> {
        let store = self.coordinator.store();
        let mut picked = 0;

        while !*shutdown.borrow() {
            let token = self.coordinator.lease_token();
            let Some(job) = store.claim_next_migration_job(&token, self.coordinator.lease_secs())?
            else {
                break;
            };
            picked += 1;
            debug!(job_id = %job.id, tenant_id = %job.tenant_id, phase = ?job.phase, %token, "claimed migration job");
            match self.coordinator.drive(&job.id, &token).await {
                Ok(done) => info!(job_id = %done.id, tenant_id = %done.tenant_id, "migration job finished"),
                Err(MigrationError::State(e)) => return Err(MigrationError::State(e)),
                Err(e) => warn!(job_id = %job.id, error = %e, "migration job did not complete"),
            }
        }
        Ok(picked)
    }

    /// Poll on an interval until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.coordinator.worker_id(),
            interval_ms = self.interval.as_millis() as u64,
            "migration worker started"
        );

        let stop = shutdown.clone();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.poll_once(&stop).await {
                        error!(error = %e, "migration worker poll failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("migration worker shutting down");
                    break;
                }
            }
        }
    }
}
