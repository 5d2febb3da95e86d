//! Orchestrator: drives provisioning jobs through their phases.
//!
//! Jobs are claimed under a lease before any phase runs, so two drivers
//! never run the same job at once. Every driving call takes its own lease
//! token (worker id plus a random suffix), which keeps callers inside one
//! process apart as well, and progress is only written while that token
//! still holds the lease. A phase that fails is retried with
//! exponential backoff until `max_attempts` is used up or the job passes
//! its deadline; the job is then `failed` and its pool `error`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use pgfleet_core::config::{ProvisionSettings, duration_or};
use pgfleet_core::{
    ResourceLimits, ServerSpec, VolumeProvisioner, VolumeRequest, WorkloadExecutor, epoch_secs,
};
use pgfleet_state::*;

use crate::error::{ProvisionError, ProvisionResult};
use crate::queue::{ProvisionQueue, ProvisionRequest};

/// Parsed timing knobs.
#[derive(Debug, Clone)]
struct Timing {
    ready_poll: Duration,
    ready_timeout: Duration,
    backoff_base: Duration,
    backoff_max: Duration,
    job_deadline: Duration,
    lease_secs: u64,
    max_attempts: u32,
}

impl Timing {
    fn from_settings(settings: &ProvisionSettings) -> Self {
        Self {
            ready_poll: duration_or(&settings.ready_poll_interval, Duration::from_secs(2)),
            ready_timeout: duration_or(&settings.ready_timeout, Duration::from_secs(300)),
            backoff_base: duration_or(&settings.backoff_base, Duration::from_secs(1)),
            backoff_max: duration_or(&settings.backoff_max, Duration::from_secs(30)),
            job_deadline: duration_or(&settings.job_deadline, Duration::from_secs(1200)),
            lease_secs: duration_or(&settings.lease, Duration::from_secs(120))
                .as_secs()
                .max(1),
            max_attempts: settings.max_attempts.max(1),
        }
    }

    /// Delay before retry number `attempt` (1-based): base doubling, capped.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// Provisions pools by running jobs from the state store.
pub struct Orchestrator {
    store: StateStore,
    queue: ProvisionQueue,
    volumes: Arc<dyn VolumeProvisioner>,
    executor: Arc<dyn WorkloadExecutor>,
    worker_id: String,
    timing: Timing,
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        settings: ProvisionSettings,
        volumes: Arc<dyn VolumeProvisioner>,
        executor: Arc<dyn WorkloadExecutor>,
    ) -> Self {
        let short = Uuid::new_v4().to_string();
        Self {
            queue: ProvisionQueue::new(store.clone(), settings.clone()),
            store,
            volumes,
            executor,
            worker_id: format!("provision-{}", &short[..8]),
            timing: Timing::from_settings(&settings),
        }
    }

    /// Override the worker id that prefixes every lease token.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn queue(&self) -> &ProvisionQueue {
        &self.queue
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

    /// Admin entry point: ask for a new shared pool.
    ///
    /// Returns the in-flight shared job instead when one exists.
    pub fn enqueue_pool(&self, max_instances: u32) -> ProvisionResult<ProvisioningJob> {
        let request = ProvisionRequest::shared(self.queue.settings(), max_instances);
        Ok(self.queue.enqueue(request)?.into_job())
    }

    pub fn job(&self, job_id: &str) -> ProvisionResult<ProvisioningJob> {
        self.store
            .get_provisioning_job(job_id)?
            .ok_or_else(|| ProvisionError::JobNotFound(job_id.to_string()))
    }

    /// Provision a dedicated pool for one tenant and wait for it.
    ///
    /// Returns the tenant's existing dedicated pool when it already has one.
    pub async fn provision_dedicated(
        &self,
        owner: PoolOwner,
        resources: ResourceLimits,
    ) -> ProvisionResult<PoolRecord> {
        let existing = self
            .store
            .list_pools(&PoolFilter {
                status: None,
                kind: Some(PoolKind::Dedicated),
            })?
            .into_iter()
            .find(|p| {
                p.status.is_serving()
                    && p.owner.as_ref().is_some_and(|o| o.tenant_id == owner.tenant_id)
            });
        if let Some(pool) = existing {
            debug!(pool_id = %pool.id, tenant_id = %owner.tenant_id, "dedicated pool already exists");
            return Ok(pool);
        }

        let tenant_id = owner.tenant_id.clone();
        let job = self
            .queue
            .enqueue(ProvisionRequest::dedicated(owner, resources))?
            .into_job();
        info!(job_id = %job.id, %tenant_id, "provisioning dedicated pool");

        let job = self.run_to_completion(&job.id, self.timing.job_deadline).await?;
        self.store
            .get_pool(&job.pool_id)?
            .ok_or_else(|| ProvisionError::Failed {
                job_id: job.id.clone(),
                reason: format!("pool {} missing after completion", job.pool_id),
            })
    }

    /// Execute exactly one phase of a job.
    ///
    /// Returns the job as persisted afterwards. A failed phase that still
    /// has attempts left is recorded on the job (`attempts`, `last_error`)
    /// and returned as `Ok`; once the job fails for good the error is
    /// returned. The lease is given up again before returning.
    pub async fn advance(&self, job_id: &str) -> ProvisionResult<ProvisioningJob> {
        let token = self.lease_token();
        let job = self.claim(job_id, &token)?;
        match job.status {
            JobStatus::Completed => Ok(job),
            JobStatus::Failed => Err(failure_of(&job)),
            _ => {
                let mut job = self.advance_claimed(job, &token).await?;
                if job.lease.is_some() {
                    job.lease = None;
                    self.persist(&job, &token)?;
                }
                Ok(job)
            }
        }
    }

    /// Drive a job to a terminal state, holding its lease.
    ///
    /// Fails with [`ProvisionError::Leased`] when any other driver owns the
    /// job, including another call on this orchestrator.
    pub async fn run_job(&self, job_id: &str) -> ProvisionResult<ProvisioningJob> {
        let token = self.lease_token();
        self.drive(job_id, &token).await
    }

    /// [`Self::run_job`] under a token the caller already claimed with.
    pub(crate) async fn drive(&self, job_id: &str, token: &str) -> ProvisionResult<ProvisioningJob> {
        loop {
            let job = self.claim(job_id, token)?;
            match job.status {
                JobStatus::Completed => return Ok(job),
                JobStatus::Failed => return Err(failure_of(&job)),
                _ => {}
            }

            let attempts = job.attempts;
            let job = self.advance_claimed(job, token).await?;
            if job.status == JobStatus::Completed {
                return Ok(job);
            }
            if job.attempts > attempts {
                let delay = self.timing.backoff(job.attempts);
                debug!(job_id, attempts = job.attempts, ?delay, "backing off before retry");
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Drive a job, or wait for whichever worker holds it, up to `ceiling`.
    pub async fn run_to_completion(
        &self,
        job_id: &str,
        ceiling: Duration,
    ) -> ProvisionResult<ProvisioningJob> {
        let drive = async {
            loop {
                match self.run_job(job_id).await {
                    Err(ProvisionError::Leased(_)) => {
                        tokio::time::sleep(self.timing.ready_poll).await;
                    }
                    other => return other,
                }
            }
        };
        tokio::time::timeout(ceiling, drive).await.map_err(|_| {
            ProvisionError::Timeout(format!("job {job_id} did not finish within {ceiling:?}"))
        })?
    }

    // ── Internals ──────────────────────────────────────────────────

    /// Take or renew the lease. Terminal jobs are returned as-is.
    fn claim(&self, job_id: &str, token: &str) -> ProvisionResult<ProvisioningJob> {
        if let Some(job) = self
            .store
            .claim_provisioning_job(job_id, token, self.timing.lease_secs)?
        {
            return Ok(job);
        }
        let job = self.job(job_id)?;
        if job.status.is_terminal() {
            Ok(job)
        } else {
            Err(ProvisionError::Leased(job_id.to_string()))
        }
    }

    /// Write the job back, provided `token` still holds its lease.
    fn persist(&self, job: &ProvisioningJob, token: &str) -> ProvisionResult<()> {
        match self.store.save_provisioning_job(job, token) {
            Ok(()) => Ok(()),
            Err(StateError::Conflict(_)) => {
                warn!(job_id = %job.id, %token, "lease lost, dropping progress");
                Err(ProvisionError::Leased(job.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn advance_claimed(
        &self,
        mut job: ProvisioningJob,
        token: &str,
    ) -> ProvisionResult<ProvisioningJob> {
        if epoch_secs() >= job.deadline_at {
            let error = ProvisionError::Timeout(format!("job {} passed its deadline", job.id));
            return self.fail(job, token, error);
        }

        job.status = JobStatus::Running;
        let phase = job.phase;
        match self.step(&mut job, token).await {
            Ok(()) => {
                job.updated_at = epoch_secs();
                if job.phase == ProvisionPhase::Completed {
                    job.status = JobStatus::Completed;
                    job.lease = None;
                    info!(job_id = %job.id, pool_id = %job.pool_id, "provisioning completed");
                } else {
                    debug!(job_id = %job.id, completed = ?phase, next = ?job.phase, "phase done");
                }
                self.persist(&job, token)?;
                Ok(job)
            }
            Err(e @ ProvisionError::Leased(_)) => Err(e),
            Err(e) => {
                job.attempts += 1;
                job.last_error = Some(format!("{phase:?}: {e}"));
                if job.attempts >= self.timing.max_attempts {
                    return self.fail(job, token, e);
                }
                warn!(
                    job_id = %job.id,
                    ?phase,
                    attempts = job.attempts,
                    error = %e,
                    "provisioning phase failed, will retry"
                );
                job.updated_at = epoch_secs();
                self.persist(&job, token)?;
                Ok(job)
            }
        }
    }

    /// Mark a job failed and its pool `error`, then return `error`.
    fn fail(
        &self,
        mut job: ProvisioningJob,
        token: &str,
        error: ProvisionError,
    ) -> ProvisionResult<ProvisioningJob> {
        job.status = JobStatus::Failed;
        job.lease = None;
        job.updated_at = epoch_secs();
        if job.last_error.is_none() {
            job.last_error = Some(error.to_string());
        }
        self.persist(&job, token)?;

        match self.store.update_pool(&job.pool_id, |p| {
            p.status = PoolStatus::Error;
            true
        }) {
            Ok(_) | Err(StateError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        warn!(
            job_id = %job.id,
            pool_id = %job.pool_id,
            attempts = job.attempts,
            error = %error,
            "provisioning job failed"
        );
        Err(error)
    }

    async fn step(&self, job: &mut ProvisioningJob, token: &str) -> ProvisionResult<()> {
        match job.phase {
            ProvisionPhase::AllocateStorage => self.allocate_storage(job).await?,
            ProvisionPhase::CreateServer => self.create_server(job).await?,
            ProvisionPhase::AwaitReady => self.await_ready(job, token).await?,
            ProvisionPhase::RegisterPool => self.register_pool(job)?,
            ProvisionPhase::Completed => return Ok(()),
        }
        job.phase = job.phase.next();
        Ok(())
    }

    async fn allocate_storage(&self, job: &mut ProvisioningJob) -> ProvisionResult<()> {
        let volume = match &job.volume {
            Some(volume) => volume.clone(),
            None => match self.volumes.find_volume(&job.pool_name).await? {
                Some(volume) => {
                    debug!(job_id = %job.id, volume_id = %volume.id, "reusing volume from an earlier attempt");
                    volume
                }
                None => {
                    let request = VolumeRequest {
                        name: job.pool_name.clone(),
                        size_gb: job.resources.storage_gb,
                    };
                    self.volumes.allocate_volume(&request).await?
                }
            },
        };
        job.volume = Some(volume.clone());

        if self.store.get_pool(&job.pool_id)?.is_none() {
            let now = epoch_secs();
            self.store.put_pool(&PoolRecord {
                id: job.pool_id.clone(),
                name: job.pool_name.clone(),
                host: String::new(),
                port: 0,
                kind: job.kind,
                current_instances: 0,
                max_instances: job.max_instances,
                status: PoolStatus::Provisioning,
                health: HealthStatus::Unknown,
                last_health_check: None,
                consecutive_failures: 0,
                owner: job.owner.clone(),
                priority: job.priority,
                resources: job.resources.clone(),
                volume_handle: Some(volume.id),
                storage_path: Some(volume.mount_path),
                executor_id: None,
                created_at: now,
                updated_at: now,
            })?;
        }
        Ok(())
    }

    async fn create_server(&self, job: &mut ProvisioningJob) -> ProvisionResult<()> {
        let volume = job.volume.clone().ok_or_else(|| missing_marker(job, "volume"))?;
        let server = match &job.server {
            Some(server) => server.clone(),
            None => match self.executor.find_server(&job.pool_name).await? {
                Some(server) => {
                    debug!(job_id = %job.id, executor_id = %server.executor_id, "reusing server from an earlier attempt");
                    server
                }
                None => {
                    let spec = ServerSpec {
                        name: job.pool_name.clone(),
                        kind: job.kind,
                        volume_id: volume.id,
                        mount_path: volume.mount_path,
                        resources: job.resources.clone(),
                    };
                    self.executor.start_server(&spec).await?
                }
            },
        };
        job.server = Some(server.clone());

        self.store.update_pool(&job.pool_id, |p| {
            p.host = server.host.clone();
            p.port = server.port;
            p.executor_id = Some(server.executor_id.clone());
            if p.status == PoolStatus::Provisioning {
                p.status = PoolStatus::Initializing;
            }
            true
        })?;
        Ok(())
    }

    async fn await_ready(&self, job: &mut ProvisioningJob, token: &str) -> ProvisionResult<()> {
        if job.ready_at.is_some() {
            return Ok(());
        }
        let server = job.server.clone().ok_or_else(|| missing_marker(job, "server"))?;
        let started = Instant::now();

        loop {
            if self.executor.is_ready(&server.executor_id).await? {
                job.ready_at = Some(epoch_secs());
                debug!(job_id = %job.id, executor_id = %server.executor_id, "server ready");
                return Ok(());
            }
            if started.elapsed() >= self.timing.ready_timeout {
                return Err(ProvisionError::Timeout(format!(
                    "server {} not ready after {:?}",
                    server.executor_id, self.timing.ready_timeout
                )));
            }
            // Keep the lease alive across long readiness waits.
            match self
                .store
                .claim_provisioning_job(&job.id, token, self.timing.lease_secs)?
            {
                Some(renewed) => job.lease = renewed.lease,
                None => return Err(ProvisionError::Leased(job.id.clone())),
            }
            tokio::time::sleep(self.timing.ready_poll).await;
        }
    }

    fn register_pool(&self, job: &mut ProvisioningJob) -> ProvisionResult<()> {
        let server = job.server.clone().ok_or_else(|| missing_marker(job, "server"))?;
        let now = epoch_secs();
        let max_instances = job.max_instances;

        self.store.update_pool(&job.pool_id, |p| {
            p.host = server.host.clone();
            p.port = server.port;
            p.executor_id = Some(server.executor_id.clone());
            p.max_instances = max_instances.max(p.current_instances);
            p.health = HealthStatus::Healthy;
            p.last_health_check = Some(now);
            p.consecutive_failures = 0;
            p.status = PoolStatus::Active;
            p.status = p.capacity_status();
            true
        })?;
        info!(
            job_id = %job.id,
            pool_id = %job.pool_id,
            host = %server.host,
            port = server.port,
            "pool registered"
        );
        Ok(())
    }
}

fn missing_marker(job: &ProvisioningJob, marker: &str) -> ProvisionError {
    ProvisionError::Failed {
        job_id: job.id.clone(),
        reason: format!("{marker} marker missing in phase {:?}", job.phase),
    }
}

fn failure_of(job: &ProvisioningJob) -> ProvisionError {
    ProvisionError::Failed {
        job_id: job.id.clone(),
        reason: job
            .last_error
            .clone()
            .unwrap_or_else(|| "failed".to_string()),
    }
}
