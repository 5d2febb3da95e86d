//! Migration coordinator: drives migration jobs through their phases.
//!
//! Every phase is safe to run again after a crash: markers on the job
//! (`target_hold`, `target`, `snapshot`, `downtime_started_at`,
//! `source_released`) record what already happened, and the cutover checks
//! the stored mapping before swapping it. Like provisioning, each driving
//! call leases the job under its own token and only writes progress while
//! it still holds that lease.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pgfleet_core::config::{MigrationSettings, duration_or};
use pgfleet_core::{
    CollaboratorResult, CredentialHandle, Credentials, DataMover, Repoint, TenantWorkload,
    epoch_secs,
};
use pgfleet_planner::{AllocationPlanner, AllocationRequest, AllocationResult, SlotLedger};
use pgfleet_provision::Orchestrator;
use pgfleet_state::*;

use crate::error::{MigrationError, MigrationResult};

#[derive(Debug, Clone)]
struct Timing {
    target_timeout: Duration,
    phase_timeout: Duration,
    lease_secs: u64,
}

impl Timing {
    fn from_settings(settings: &MigrationSettings) -> Self {
        Self {
            target_timeout: duration_or(&settings.target_timeout, Duration::from_secs(1200)),
            phase_timeout: duration_or(&settings.phase_timeout, Duration::from_secs(600)),
            lease_secs: duration_or(&settings.lease, Duration::from_secs(1800))
                .as_secs()
                .max(1),
        }
    }
}

pub struct MigrationCoordinator {
    store: StateStore,
    planner: Arc<AllocationPlanner>,
    orchestrator: Arc<Orchestrator>,
    workload: Arc<dyn TenantWorkload>,
    mover: Arc<dyn DataMover>,
    upgrade_only: bool,
    timing: Timing,
    worker_id: String,
    /// Target credentials from reservation until cutover. Never persisted.
    target_credentials: Mutex<HashMap<JobId, Credentials>>,
}

impl MigrationCoordinator {
    pub fn new(
        store: StateStore,
        planner: Arc<AllocationPlanner>,
        orchestrator: Arc<Orchestrator>,
        workload: Arc<dyn TenantWorkload>,
        mover: Arc<dyn DataMover>,
        settings: MigrationSettings,
    ) -> Self {
        let short = Uuid::new_v4().to_string();
        Self {
            store,
            planner,
            orchestrator,
            workload,
            mover,
            upgrade_only: settings.upgrade_only,
            timing: Timing::from_settings(&settings),
            worker_id: format!("migrate-{}", &short[..8]),
            target_credentials: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub(crate) fn lease_secs(&self) -> u64 {
        self.timing.lease_secs
    }

    /// A lease owner name unique to one driving call.
    pub(crate) fn lease_token(&self) -> String {
        let short = Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.worker_id, &short[..8])
    }

    pub fn job(&self, job_id: &str) -> MigrationResult<MigrationJob> {
        self.store
            .get_migration_job(job_id)?
            .ok_or_else(|| MigrationError::NotFound(job_id.to_string()))
    }

    /// Validate a migration request and create its job.
    ///
    /// Nothing is persisted when validation fails.
    pub fn request(&self, tenant_id: &str, target_kind: PoolKind) -> MigrationResult<MigrationJob> {
        let source = self
            .store
            .get_allocation(tenant_id)?
            .ok_or_else(|| MigrationError::Validation(format!("tenant {tenant_id} is not allocated")))?;
        self.validate_target(&source, target_kind)?;

        let now = epoch_secs();
        let job = MigrationJob {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            customer_id: source.customer_id.clone(),
            source,
            target_kind,
            phase: MigrationPhase::Preparing,
            status: MigrationStatus::Running,
            target: None,
            target_hold: None,
            target_job_id: None,
            snapshot: None,
            downtime_started_at: None,
            downtime_ended_at: None,
            source_released: false,
            last_error: None,
            lease: None,
            created_at: now,
            updated_at: now,
        };
        match self.store.insert_migration_job(&job) {
            Ok(()) => {}
            Err(StateError::Conflict(reason)) => return Err(MigrationError::Validation(reason)),
            Err(e) => return Err(e.into()),
        }

        info!(
            job_id = %job.id,
            %tenant_id,
            from = %job.source.kind,
            to = %target_kind,
            "migration requested"
        );
        Ok(job)
    }

    /// Drive a job to a terminal state under its lease.
    ///
    /// Returns the completed job, or [`MigrationError::PhaseFailed`]
    /// telling whether the failure was rolled back.
    pub async fn run_job(&self, job_id: &str) -> MigrationResult<MigrationJob> {
        let token = self.lease_token();
        self.drive(job_id, &token).await
    }

    /// [`Self::run_job`] under a token the caller already claimed with.
    pub(crate) async fn drive(&self, job_id: &str, token: &str) -> MigrationResult<MigrationJob> {
        let mut job = self.claim(job_id, token)?;
        match job.status {
            MigrationStatus::Running => {}
            MigrationStatus::Completed => return Ok(job),
            MigrationStatus::RolledBack | MigrationStatus::Failed => return Err(failure_of(&job)),
        }

        while job.phase != MigrationPhase::Completed {
            let phase = job.phase;
            if let Err(e) = self.step(&mut job, token).await {
                return self.handle_failure(job, phase, e, token).await;
            }
            job.phase = phase.next();
            self.save(&mut job, token)?;
            debug!(job_id = %job.id, completed = ?phase, next = ?job.phase, "migration phase done");
        }

        job.status = MigrationStatus::Completed;
        job.lease = None;
        self.save(&mut job, token)?;
        let downtime = job
            .downtime_started_at
            .zip(job.downtime_ended_at)
            .map(|(start, end)| end.saturating_sub(start));
        info!(
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            downtime_secs = ?downtime,
            "migration completed"
        );
        Ok(job)
    }

    // ── Phases ─────────────────────────────────────────────────────

    async fn step(&self, job: &mut MigrationJob, token: &str) -> MigrationResult<()> {
        // Without the target credentials the cutover cannot repoint the
        // tenant, so there is no point pausing writes or moving data.
        let needs_credentials = matches!(
            job.phase,
            MigrationPhase::Draining
                | MigrationPhase::Snapshotting
                | MigrationPhase::Transferring
                | MigrationPhase::Verifying
        );
        if needs_credentials && !self.holds_credentials(job) {
            return Err(MigrationError::CredentialsLost(job.id.clone()));
        }

        match job.phase {
            MigrationPhase::Preparing => self.prepare(job),
            MigrationPhase::ProvisioningTarget => self.provision_target(job, token).await,
            MigrationPhase::Draining => self.drain(job).await,
            MigrationPhase::Snapshotting => self.snapshot(job).await,
            MigrationPhase::Transferring => self.transfer(job).await,
            MigrationPhase::Verifying => self.verify(job).await,
            MigrationPhase::Cutover => self.cutover(job).await,
            MigrationPhase::Cleanup => self.cleanup(job, token),
            MigrationPhase::Completed => Ok(()),
        }
    }

    /// The mapping must still be the one the request saw.
    fn prepare(&self, job: &MigrationJob) -> MigrationResult<()> {
        let current = self.store.get_allocation(&job.tenant_id)?.ok_or_else(|| {
            MigrationError::Validation(format!("tenant {} is no longer allocated", job.tenant_id))
        })?;
        if current.generation != job.source.generation || current.pool_id != job.source.pool_id {
            return Err(MigrationError::Validation(format!(
                "allocation of tenant {} changed since the migration was requested",
                job.tenant_id
            )));
        }
        self.validate_target(&current, job.target_kind)
    }

    /// Reserve a slot of the target kind, provisioning a pool first when
    /// none has room.
    ///
    /// The slot is recorded on the job as `target_hold` in the same
    /// transaction that takes it, and turned into `target` once the tenant
    /// database exists. A hold found on entry belongs to a run that died in
    /// between; its credentials are gone, so it is given back first.
    async fn provision_target(&self, job: &mut MigrationJob, token: &str) -> MigrationResult<()> {
        if job.target.is_some() {
            if !self.holds_credentials(job) {
                return Err(MigrationError::CredentialsLost(job.id.clone()));
            }
            return Ok(());
        }
        if let Some(pool_id) = self.store.release_migration_hold(&job.id, token)? {
            warn!(job_id = %job.id, %pool_id, "released slot of an interrupted target reservation");
        }
        job.target_hold = None;

        let request = AllocationRequest {
            tenant_id: job.tenant_id.clone(),
            customer_id: job.customer_id.clone(),
            kind: job.target_kind,
        };
        let started = Instant::now();
        let ceiling = self.timing.target_timeout;
        let timed_out = || {
            MigrationError::Timeout(format!(
                "no {} target for tenant {} within {ceiling:?}",
                request.kind, request.tenant_id
            ))
        };

        loop {
            let remaining = self
                .timing
                .target_timeout
                .checked_sub(started.elapsed())
                .filter(|d| !d.is_zero())
                .ok_or_else(timed_out)?;
            let ledger = TargetHold {
                store: &self.store,
                job_id: &job.id,
                owner: token,
            };
            let result = tokio::time::timeout(
                remaining,
                self.planner.reserve_slot_with(&request, &ledger),
            )
            .await
            .map_err(|_| timed_out())??;

            match result {
                AllocationResult::Allocated {
                    pool_id,
                    host,
                    port,
                    database_name,
                    credentials,
                } => {
                    info!(job_id = %job.id, tenant_id = %job.tenant_id, %pool_id, "migration target reserved");
                    job.target = Some(TenantAllocation {
                        tenant_id: job.tenant_id.clone(),
                        customer_id: job.customer_id.clone(),
                        kind: job.target_kind,
                        pool_id,
                        host,
                        port,
                        database_name,
                        generation: job.source.generation + 1,
                        allocated_at: epoch_secs(),
                    });
                    job.target_hold = None;
                    self.credentials().insert(job.id.clone(), credentials);
                    self.save(job, token)?;
                    return Ok(());
                }
                AllocationResult::Pending { job_id, .. } => {
                    debug!(job_id = %job.id, provisioning_job = %job_id, "waiting for target pool");
                    if job.target_job_id.as_deref() != Some(job_id.as_str()) {
                        job.target_job_id = Some(job_id.clone());
                        self.save(job, token)?;
                    }
                    self.orchestrator.run_to_completion(&job_id, remaining).await?;
                }
                AllocationResult::Failed { reason } => {
                    return Err(MigrationError::Validation(format!(
                        "target allocation refused: {reason}"
                    )));
                }
            }
        }
    }

    async fn drain(&self, job: &mut MigrationJob) -> MigrationResult<()> {
        self.bounded("pause writes", self.workload.pause_writes(&job.tenant_id))
            .await?;
        if job.downtime_started_at.is_none() {
            job.downtime_started_at = Some(epoch_secs());
            info!(job_id = %job.id, tenant_id = %job.tenant_id, "writes paused, downtime started");
        }
        Ok(())
    }

    async fn snapshot(&self, job: &mut MigrationJob) -> MigrationResult<()> {
        if job.snapshot.is_some() {
            return Ok(());
        }
        let snapshot = self
            .bounded(
                "export",
                self.mover.export(&job.tenant_id, &job.source.location()),
            )
            .await?;
        debug!(job_id = %job.id, snapshot_id = %snapshot.id, size_bytes = snapshot.size_bytes, "snapshot taken");
        job.snapshot = Some(snapshot);
        Ok(())
    }

    async fn transfer(&self, job: &MigrationJob) -> MigrationResult<()> {
        let snapshot = job
            .snapshot
            .as_ref()
            .ok_or_else(|| missing_marker(job, "snapshot"))?;
        let target = target_of(job)?;
        self.bounded("import", self.mover.import(snapshot, &target.location()))
            .await
    }

    async fn verify(&self, job: &MigrationJob) -> MigrationResult<()> {
        let target = target_of(job)?;
        let report = self
            .bounded(
                "verify",
                self.mover.verify(&job.source.location(), &target.location()),
            )
            .await?;
        if !report.matches() {
            return Err(MigrationError::Verification(format!(
                "source has {} tables / {} rows, target has {} tables / {} rows",
                report.source_tables, report.source_rows, report.target_tables, report.target_rows
            )));
        }
        Ok(())
    }

    /// Swap the mapping, then repoint the workload. The swap is the point
    /// of no return.
    async fn cutover(&self, job: &mut MigrationJob) -> MigrationResult<()> {
        let target = target_of(job)?.clone();
        let swapped = self.mapping_swapped(job)?;
        let credentials = self
            .credentials()
            .get(&job.id)
            .cloned()
            .ok_or_else(|| MigrationError::CredentialsLost(job.id.clone()))?;

        if !swapped {
            self.store
                .swap_allocation(&job.tenant_id, job.source.generation, target.clone())?;
            info!(
                job_id = %job.id,
                tenant_id = %job.tenant_id,
                from = %job.source.pool_id,
                to = %target.pool_id,
                "tenant mapping swapped"
            );
        }

        let repoint = Repoint {
            endpoint: target.endpoint(),
            database_name: target.database_name.clone(),
            credentials: CredentialHandle::new(
                format!("{}@{}", job.tenant_id, target.pool_id),
                credentials,
            ),
        };
        self.bounded(
            "resume writes on target",
            self.workload.resume_writes(&job.tenant_id, Some(repoint)),
        )
        .await?;

        self.credentials().remove(&job.id);
        job.downtime_ended_at = Some(epoch_secs());
        Ok(())
    }

    /// Give the source slot back and retire an unreferenced dedicated source.
    fn cleanup(&self, job: &mut MigrationJob, token: &str) -> MigrationResult<()> {
        if !job.source_released {
            self.planner.capacity().release(&job.source.pool_id)?;
            job.source_released = true;
            self.save(job, token)?;
        }

        if job.source.kind == PoolKind::Dedicated
            && self.store.count_allocations_on_pool(&job.source.pool_id)? == 0
        {
            match self.store.update_pool(&job.source.pool_id, |p| {
                if p.status == PoolStatus::Decommissioned {
                    return false;
                }
                p.status = PoolStatus::Decommissioned;
                true
            }) {
                Ok(update) if update.applied => {
                    info!(pool_id = %job.source.pool_id, "dedicated source pool decommissioned");
                }
                Ok(_) | Err(StateError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    // ── Failure handling ───────────────────────────────────────────

    async fn handle_failure(
        &self,
        mut job: MigrationJob,
        phase: MigrationPhase,
        error: MigrationError,
        token: &str,
    ) -> MigrationResult<MigrationJob> {
        if matches!(error, MigrationError::Leased(_)) {
            return Err(error);
        }
        let reason = error.to_string();
        job.last_error = Some(format!("{phase:?}: {reason}"));
        job.lease = None;

        let reversible = phase.is_before_cutover()
            || (phase == MigrationPhase::Cutover && !self.mapping_swapped(&job)?);
        if !reversible {
            job.status = MigrationStatus::Failed;
            self.save(&mut job, token)?;
            error!(
                job_id = %job.id,
                tenant_id = %job.tenant_id,
                ?phase,
                %reason,
                "migration failed after cutover, operator action required"
            );
            return Err(MigrationError::PhaseFailed {
                phase,
                rolled_back: false,
                reason,
            });
        }

        match self.roll_back(&mut job, token).await {
            Ok(()) => {
                job.status = MigrationStatus::RolledBack;
                self.save(&mut job, token)?;
                warn!(job_id = %job.id, tenant_id = %job.tenant_id, ?phase, %reason, "migration rolled back");
                Err(MigrationError::PhaseFailed {
                    phase,
                    rolled_back: true,
                    reason,
                })
            }
            Err(rollback) => {
                let reason = format!("{reason}; rollback failed: {rollback}");
                job.status = MigrationStatus::Failed;
                job.last_error = Some(format!("{phase:?}: {reason}"));
                self.save(&mut job, token)?;
                error!(job_id = %job.id, tenant_id = %job.tenant_id, ?phase, %reason, "migration rollback failed");
                Err(MigrationError::PhaseFailed {
                    phase,
                    rolled_back: false,
                    reason,
                })
            }
        }
    }

    /// Resume writes on the source and give back the target slot.
    async fn roll_back(&self, job: &mut MigrationJob, token: &str) -> MigrationResult<()> {
        if job.downtime_started_at.is_some() && job.downtime_ended_at.is_none() {
            self.bounded(
                "resume writes on source",
                self.workload.resume_writes(&job.tenant_id, None),
            )
            .await?;
            job.downtime_ended_at = Some(epoch_secs());
        }
        if let Some(target) = &job.target {
            self.planner.capacity().release(&target.pool_id)?;
        }
        if let Some(pool_id) = self.store.release_migration_hold(&job.id, token)? {
            debug!(job_id = %job.id, %pool_id, "held target slot released");
        }
        job.target_hold = None;
        self.credentials().remove(&job.id);
        Ok(())
    }

    // ── Internals ──────────────────────────────────────────────────

    fn validate_target(&self, source: &TenantAllocation, target: PoolKind) -> MigrationResult<()> {
        if target == PoolKind::Platform {
            return Err(MigrationError::Validation(
                "platform pools cannot host tenants".to_string(),
            ));
        }
        if target == source.kind {
            return Err(MigrationError::Validation(format!(
                "tenant {} is already on a {target} pool",
                source.tenant_id
            )));
        }
        if self.upgrade_only {
            let upgrade = matches!(
                (source.kind.tier(), target.tier()),
                (Some(from), Some(to)) if to > from
            );
            if !upgrade {
                return Err(MigrationError::Validation(format!(
                    "only upgrades are allowed, {} to {target} is not one",
                    source.kind
                )));
            }
        }
        Ok(())
    }

    /// Whether the stored mapping already points at the target.
    fn mapping_swapped(&self, job: &MigrationJob) -> MigrationResult<bool> {
        let Some(target) = &job.target else {
            return Ok(false);
        };
        Ok(self
            .store
            .get_allocation(&job.tenant_id)?
            .is_some_and(|a| a.pool_id == target.pool_id && a.generation > job.source.generation))
    }

    fn claim(&self, job_id: &str, token: &str) -> MigrationResult<MigrationJob> {
        if let Some(job) = self
            .store
            .claim_migration_job(job_id, token, self.timing.lease_secs)?
        {
            return Ok(job);
        }
        let job = self.job(job_id)?;
        if job.status.is_terminal() {
            Ok(job)
        } else {
            Err(MigrationError::Leased(job_id.to_string()))
        }
    }

    /// Persist progress and push the lease forward, provided `token`
    /// still holds the lease.
    fn save(&self, job: &mut MigrationJob, token: &str) -> MigrationResult<()> {
        let now = epoch_secs();
        if let Some(lease) = job.lease.as_mut() {
            lease.expires_at = now + self.timing.lease_secs;
        }
        job.updated_at = now;
        match self.store.save_migration_job(job, token) {
            Ok(()) => Ok(()),
            Err(StateError::Conflict(_)) => {
                warn!(job_id = %job.id, %token, "lease lost, dropping progress");
                Err(MigrationError::Leased(job.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn holds_credentials(&self, job: &MigrationJob) -> bool {
        self.credentials().contains_key(&job.id)
    }

    async fn bounded<T, F>(&self, what: &str, call: F) -> MigrationResult<T>
    where
        F: Future<Output = CollaboratorResult<T>>,
    {
        match tokio::time::timeout(self.timing.phase_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(MigrationError::Timeout(format!(
                "{what} did not finish within {:?}",
                self.timing.phase_timeout
            ))),
        }
    }

    fn credentials(&self) -> MutexGuard<'_, HashMap<JobId, Credentials>> {
        self.target_credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// Slots taken for a migration target, recorded on the job as they move.
struct TargetHold<'a> {
    store: &'a StateStore,
    job_id: &'a str,
    owner: &'a str,
}

impl SlotLedger for TargetHold<'_> {
    fn reserve(&self, pool_id: &str) -> StateResult<bool> {
        self.store.hold_migration_slot(self.job_id, self.owner, pool_id)
    }

    fn release(&self, _pool_id: &str) -> StateResult<()> {
        self.store.release_migration_hold(self.job_id, self.owner)?;
        Ok(())
    }
}

fn target_of(job: &MigrationJob) -> MigrationResult<&TenantAllocation> {
    job.target.as_ref().ok_or_else(|| missing_marker(job, "target"))
}

fn missing_marker(job: &MigrationJob, what: &str) -> MigrationError {
    MigrationError::State(StateError::Invalid(format!(
        "migration job {} reached {:?} without a {what}",
        job.id, job.phase
    )))
}

fn failure_of(job: &MigrationJob) -> MigrationError {
    MigrationError::PhaseFailed {
        phase: job.phase,
        rolled_back: job.status == MigrationStatus::RolledBack,
        reason: job
            .last_error
            .clone()
            .unwrap_or_else(|| "migration did not complete".to_string()),
    }
}
