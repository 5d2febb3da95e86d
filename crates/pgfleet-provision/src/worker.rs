//! Background worker that drains the provisioning queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{ProvisionError, ProvisionResult};
use crate::orchestrator::Orchestrator;

/// Claims runnable provisioning jobs (queued, or with an expired lease)
/// and drives each to a terminal state.
pub struct ProvisionWorker {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

impl ProvisionWorker {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// Run every claimable job once. Returns how many jobs were picked up.
    ///
    /// No new job is claimed once `shutdown` has fired.
    pub async fn poll_once(&self, shutdown: &watch::Receiver<bool>) -> ProvisionResult<usize> {
        let store = self.orchestrator.store();
        let mut picked = 0;

        while !*shutdown.borrow() {
            let token = self.orchestrator.lease_token();
            let Some(job) = store.claim_next_provisioning_job(&token, self.orchestrator.lease_secs())?
            else {
                break;
            };
            picked += 1;
            debug!(job_id = %job.id, phase = ?job.phase, %token, "claimed provisioning job");
            match self.orchestrator.drive(&job.id, &token).await {
                Ok(done) => info!(job_id = %done.id, pool_id = %done.pool_id, "provisioning job finished"),
                Err(ProvisionError::State(e)) => return Err(ProvisionError::State(e)),
                // Already recorded on the job.
                Err(e) => warn!(job_id = %job.id, error = %e, "provisioning job ended in failure"),
            }
        }
        Ok(picked)
    }

    /// Poll on an interval until `shutdown` flips.
    ///
    /// A job still running at shutdown is abandoned mid-phase; its lease
    /// runs out and the next worker resumes it.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.orchestrator.worker_id(),
            interval_ms = self.interval.as_millis() as u64,
            "provision worker started"
        );

        let stop = shutdown.clone();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => break,
            }
            tokio::select! {
                result = self.poll_once(&stop) => {
                    if let Err(e) = result {
                        error!(error = %e, "provision worker poll failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("provision worker shutting down");
    }
}
