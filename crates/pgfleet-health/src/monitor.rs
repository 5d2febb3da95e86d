//! Health monitor: background loop that probes every serving pool.
//!
//! Each sweep probes pools in `active`, `full`, or `degraded`, folds the
//! results into the pool records through guarded updates (so concurrent
//! capacity changes are never overwritten), and flags pools stuck before
//! `active` for longer than `stale_after`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use pgfleet_core::config::{HealthSettings, duration_or};
use pgfleet_core::{PoolProber, epoch_secs};
use pgfleet_state::*;

use crate::checker::{Thresholds, apply_probe, probe_with_timeout};
use crate::error::{HealthError, HealthResult};

/// What an alert is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertKind {
    /// Health changed after a probe.
    HealthChanged {
        from: HealthStatus,
        to: HealthStatus,
    },
    /// Stuck in a pre-active or error state past `stale_after`.
    Stale { status: PoolStatus },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthAlert {
    pub pool_id: PoolId,
    pub pool_name: String,
    pub kind: AlertKind,
}

/// Callback invoked for every alert.
pub type AlertCallback = Arc<dyn Fn(HealthAlert) -> AlertFuture + Send + Sync>;

pub type AlertFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Summary of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub unhealthy: usize,
    pub stale: Vec<PoolId>,
}

pub struct HealthMonitor {
    store: StateStore,
    prober: Arc<dyn PoolProber>,
    thresholds: Thresholds,
    interval: Duration,
    probe_timeout: Duration,
    stale_after: Duration,
    on_alert: Option<AlertCallback>,
    /// Stale pools already reported and still stuck, so each episode is
    /// alerted once.
    reported_stale: Mutex<HashSet<PoolId>>,
}

impl HealthMonitor {
    pub fn new(store: StateStore, prober: Arc<dyn PoolProber>, settings: &HealthSettings) -> Self {
        Self {
            store,
            prober,
            thresholds: Thresholds::from_settings(settings),
            interval: duration_or(&settings.interval, Duration::from_secs(15)),
            probe_timeout: duration_or(&settings.probe_timeout, Duration::from_secs(2)),
            stale_after: duration_or(&settings.stale_after, Duration::from_secs(30 * 60)),
            on_alert: None,
            reported_stale: Mutex::new(HashSet::new()),
        }
    }

    /// Set a callback for alerts.
    pub fn with_alerts(mut self, callback: AlertCallback) -> Self {
        self.on_alert = Some(callback);
        self
    }

    /// Probe one pool now and persist the result.
    pub async fn check_pool(&self, pool_id: &str) -> HealthResult<PoolRecord> {
        let pool = self
            .store
            .get_pool(pool_id)?
            .ok_or_else(|| HealthError::PoolNotFound(pool_id.to_string()))?;
        if !pool.status.is_serving() {
            return Err(HealthError::NotServing {
                pool_id: pool_id.to_string(),
                status: pool.status.as_str().to_string(),
            });
        }
        self.probe_and_record(&pool).await
    }

    /// Probe every serving pool once, then flag stale ones.
    pub async fn sweep_once(&self) -> HealthResult<SweepReport> {
        let mut report = SweepReport::default();
        let pools = self.store.list_pools(&PoolFilter::default())?;

        for pool in pools.iter().filter(|p| p.status.is_serving()) {
            match self.probe_and_record(pool).await {
                Ok(updated) => {
                    report.probed += 1;
                    if updated.health == HealthStatus::Unhealthy {
                        report.unhealthy += 1;
                    }
                }
                Err(HealthError::PoolNotFound(id)) => {
                    debug!(pool_id = %id, "pool disappeared during sweep");
                }
                Err(e) => return Err(e),
            }
        }

        report.stale = self.reclaim_stale().await?;
        debug!(
            probed = report.probed,
            unhealthy = report.unhealthy,
            stale = report.stale.len(),
            "health sweep finished"
        );
        Ok(report)
    }

    /// Mark pools stuck in `provisioning`, `initializing`, or `error` for
    /// longer than `stale_after` as `error` and alert once per pool.
    /// A pool that leaves those states is forgotten, so getting stuck again
    /// alerts again. Nothing is deleted.
    pub async fn reclaim_stale(&self) -> HealthResult<Vec<PoolId>> {
        let now = epoch_secs();
        let cutoff = now.saturating_sub(self.stale_after.as_secs());
        let mut flagged = Vec::new();

        let stuck: Vec<PoolRecord> = self
            .store
            .list_pools(&PoolFilter::default())?
            .into_iter()
            .filter(|p| {
                matches!(
                    p.status,
                    PoolStatus::Provisioning | PoolStatus::Initializing | PoolStatus::Error
                )
            })
            .collect();
        {
            let stuck_ids: HashSet<&str> = stuck.iter().map(|p| p.id.as_str()).collect();
            self.reported_stale
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|id| stuck_ids.contains(id.as_str()));
        }
        let stuck = stuck.into_iter().filter(|p| p.updated_at <= cutoff);

        for pool in stuck {
            let first_report = self
                .reported_stale
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(pool.id.clone());
            if !first_report {
                continue;
            }

            let was = pool.status;
            if was != PoolStatus::Error {
                self.store.update_pool(&pool.id, |p| {
                    // A job may have moved it on since the listing.
                    if p.status != was {
                        return false;
                    }
                    p.status = PoolStatus::Error;
                    true
                })?;
            }
            warn!(pool_id = %pool.id, name = %pool.name, status = was.as_str(), "stale pool flagged");
            self.alert(HealthAlert {
                pool_id: pool.id.clone(),
                pool_name: pool.name.clone(),
                kind: AlertKind::Stale { status: was },
            })
            .await;
            flagged.push(pool.id);
        }
        Ok(flagged)
    }

    /// Sweep on an interval until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            degraded_after = self.thresholds.degraded_after,
            unhealthy_after = self.thresholds.unhealthy_after,
            "health monitor started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "health sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("health monitor shutting down");
                    break;
                }
            }
        }
    }

    async fn probe_and_record(&self, pool: &PoolRecord) -> HealthResult<PoolRecord> {
        let result = probe_with_timeout(self.prober.as_ref(), &pool.endpoint(), self.probe_timeout).await;
        let now = epoch_secs();
        let thresholds = self.thresholds;

        let mut previous = pool.health;
        let update = self
            .store
            .update_pool(&pool.id, |p| {
                previous = apply_probe(p, result, thresholds, now);
                true
            })
            .map_err(|e| match e {
                StateError::NotFound(_) => HealthError::PoolNotFound(pool.id.clone()),
                other => HealthError::State(other),
            })?;

        let record = update.record;
        if record.health != previous {
            self.alert(HealthAlert {
                pool_id: record.id.clone(),
                pool_name: record.name.clone(),
                kind: AlertKind::HealthChanged {
                    from: previous,
                    to: record.health,
                },
            })
            .await;
        }
        Ok(record)
    }

    async fn alert(&self, alert: HealthAlert) {
        if let Some(ref cb) = self.on_alert {
            cb(alert).await;
        }
    }
}
