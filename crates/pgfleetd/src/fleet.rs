//! Wiring of the control plane: one store, one set of collaborators, and
//! the services and background loops built on them.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use pgfleet_api::{ApiState, build_router};
use pgfleet_core::config::duration_or;
use pgfleet_core::{
    DataMover, EntitlementSource, FleetConfig, PoolProber, TenantWorkload, VolumeProvisioner,
    WorkloadExecutor,
};
use pgfleet_health::{AlertCallback, AlertFuture, AlertKind, HealthAlert, HealthMonitor};
use pgfleet_migrate::{MigrationCoordinator, MigrationWorker};
use pgfleet_planner::{AllocationPlanner, CachedEntitlements};
use pgfleet_provision::{Orchestrator, ProvisionQueue, ProvisionWorker};
use pgfleet_state::StateStore;

/// Implementations of every external system the control plane drives.
#[derive(Clone)]
pub struct Collaborators {
    pub volumes: Arc<dyn VolumeProvisioner>,
    pub executor: Arc<dyn WorkloadExecutor>,
    pub workload: Arc<dyn TenantWorkload>,
    pub mover: Arc<dyn DataMover>,
    pub entitlements: Arc<dyn EntitlementSource>,
    pub prober: Arc<dyn PoolProber>,
}

/// The assembled control plane.
pub struct Fleet {
    state: ApiState,
    provision_interval: Duration,
    migration_interval: Duration,
}

impl Fleet {
    pub fn assemble(store: StateStore, config: &FleetConfig, collaborators: Collaborators) -> Self {
        let entitlements = Arc::new(CachedEntitlements::new(
            collaborators.entitlements,
            duration_or(&config.planner.entitlement_ttl, Duration::from_secs(300)),
        ));
        let planner = Arc::new(AllocationPlanner::new(
            store.clone(),
            ProvisionQueue::new(store.clone(), config.provision.clone()),
            collaborators.executor.clone(),
            entitlements,
            config.planner.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            config.provision.clone(),
            collaborators.volumes,
            collaborators.executor,
        ));
        let monitor = Arc::new(
            HealthMonitor::new(store.clone(), collaborators.prober, &config.health)
                .with_alerts(log_alerts()),
        );
        let migrations = Arc::new(MigrationCoordinator::new(
            store.clone(),
            planner.clone(),
            orchestrator.clone(),
            collaborators.workload,
            collaborators.mover,
            config.migration.clone(),
        ));

        Self {
            state: ApiState {
                store,
                planner,
                orchestrator,
                monitor,
                migrations,
            },
            provision_interval: duration_or(&config.provision.worker_interval, Duration::from_secs(5)),
            migration_interval: duration_or(&config.migration.worker_interval, Duration::from_secs(5)),
        }
    }

    pub fn state(&self) -> &ApiState {
        &self.state
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Start the provisioning worker, migration worker, and health monitor.
    pub fn spawn_background(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let provision = ProvisionWorker::new(self.state.orchestrator.clone(), self.provision_interval);
        let migration = MigrationWorker::new(self.state.migrations.clone(), self.migration_interval);
        vec![
            tokio::spawn(provision.run(shutdown.clone())),
            tokio::spawn(migration.run(shutdown.clone())),
            tokio::spawn(self.state.monitor.clone().run(shutdown.clone())),
        ]
    }
}

/// Health alerts go to the log until an operator channel exists.
fn log_alerts() -> AlertCallback {
    Arc::new(|alert: HealthAlert| -> AlertFuture {
        Box::pin(async move {
            match alert.kind {
                AlertKind::HealthChanged { from, to } => warn!(
                    pool_id = %alert.pool_id,
                    pool_name = %alert.pool_name,
                    from = ?from,
                    to = ?to,
                    "pool health changed"
                ),
                AlertKind::Stale { status } => warn!(
                    pool_id = %alert.pool_id,
                    pool_name = %alert.pool_name,
                    status = ?status,
                    "pool stuck, marked error"
                ),
            }
        })
    })
}
