//! Domain types for the pool registry.
//!
//! These types represent the persisted state of PostgreSQL pools, tenant
//! allocations, provisioning jobs, and migration jobs. All types are
//! serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

pub use pgfleet_core::{
    DatabaseLocation, Endpoint, PoolKind, ResourceLimits, ServerHandle, SnapshotRef, VolumeHandle,
};

/// Unique identifier for a pool.
pub type PoolId = String;

/// Unique identifier for a provisioning or migration job.
pub type JobId = String;

/// Unique identifier for a tenant.
pub type TenantId = String;

// ── Pool ──────────────────────────────────────────────────────────

/// Lifecycle status of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Provisioning,
    Initializing,
    Active,
    Full,
    Degraded,
    Error,
    Decommissioned,
}

impl PoolStatus {
    /// Whether the server is up and hosting (or able to host) tenants.
    pub fn is_serving(self) -> bool {
        matches!(self, PoolStatus::Active | PoolStatus::Full | PoolStatus::Degraded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PoolStatus::Provisioning => "provisioning",
            PoolStatus::Initializing => "initializing",
            PoolStatus::Active => "active",
            PoolStatus::Full => "full",
            PoolStatus::Degraded => "degraded",
            PoolStatus::Error => "error",
            PoolStatus::Decommissioned => "decommissioned",
        }
    }
}

impl std::str::FromStr for PoolStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(PoolStatus::Provisioning),
            "initializing" => Ok(PoolStatus::Initializing),
            "active" => Ok(PoolStatus::Active),
            "full" => Ok(PoolStatus::Full),
            "degraded" => Ok(PoolStatus::Degraded),
            "error" => Ok(PoolStatus::Error),
            "decommissioned" => Ok(PoolStatus::Decommissioned),
            other => Err(format!("unknown pool status: {other}")),
        }
    }
}

/// Health status as determined by connectivity probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Pools in this health state may receive new tenants.
    pub fn is_allocatable(self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Unknown)
    }
}

/// Owner of a dedicated pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOwner {
    pub customer_id: String,
    pub tenant_id: TenantId,
}

/// One PostgreSQL server, shared or dedicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub id: PoolId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub kind: PoolKind,
    pub current_instances: u32,
    pub max_instances: u32,
    pub status: PoolStatus,
    pub health: HealthStatus,
    /// Unix timestamp of the last probe, if any.
    pub last_health_check: Option<u64>,
    pub consecutive_failures: u32,
    /// Set only for dedicated pools.
    pub owner: Option<PoolOwner>,
    /// Lower numbers are filled first.
    pub priority: u32,
    pub resources: ResourceLimits,
    pub volume_handle: Option<String>,
    pub storage_path: Option<String>,
    pub executor_id: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl PoolRecord {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    pub fn has_capacity(&self) -> bool {
        self.current_instances < self.max_instances
    }

    pub fn free_slots(&self) -> u32 {
        self.max_instances.saturating_sub(self.current_instances)
    }

    /// Whether the planner may place a tenant here.
    pub fn is_allocatable(&self) -> bool {
        self.status == PoolStatus::Active && self.health.is_allocatable() && self.has_capacity()
    }

    /// The `active`/`full` status implied by the current count. Any other
    /// lifecycle status is returned unchanged.
    pub fn capacity_status(&self) -> PoolStatus {
        match self.status {
            PoolStatus::Active | PoolStatus::Full => {
                if self.has_capacity() {
                    PoolStatus::Active
                } else {
                    PoolStatus::Full
                }
            }
            other => other,
        }
    }
}

/// Filter for listing pools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolFilter {
    pub status: Option<PoolStatus>,
    pub kind: Option<PoolKind>,
}

impl PoolFilter {
    pub fn matches(&self, pool: &PoolRecord) -> bool {
        self.status.is_none_or(|s| pool.status == s) && self.kind.is_none_or(|k| pool.kind == k)
    }
}

/// Extra constraints for candidate selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateFilter {
    /// Only pools owned by this tenant. `None` selects unowned pools.
    pub owner_tenant: Option<TenantId>,
}

// ── Tenant allocation ─────────────────────────────────────────────

/// The binding of a tenant to a pool. Credentials are never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantAllocation {
    pub tenant_id: TenantId,
    pub customer_id: String,
    pub kind: PoolKind,
    pub pool_id: PoolId,
    pub host: String,
    pub port: u16,
    pub database_name: String,
    /// Bumped on every swap; cutover compares it.
    pub generation: u64,
    pub allocated_at: u64,
}

impl TenantAllocation {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    pub fn location(&self) -> DatabaseLocation {
        DatabaseLocation {
            host: self.host.clone(),
            port: self.port,
            database_name: self.database_name.clone(),
        }
    }
}

// ── Jobs ──────────────────────────────────────────────────────────

/// Worker ownership of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: u64,
}

impl Lease {
    pub fn blocks(&self, worker: &str, now: u64) -> bool {
        self.owner != worker && self.expires_at > now
    }
}

/// Common surface of durable job records, used by the claim logic.
pub trait JobRecord {
    fn id(&self) -> &str;
    fn is_terminal(&self) -> bool;
    fn lease(&self) -> Option<&Lease>;
    fn set_lease(&mut self, lease: Option<Lease>);
    fn touch(&mut self, now: u64);
}

/// Result of inserting a deduplicated job.
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued<T> {
    /// A new job was stored.
    Created(T),
    /// An equivalent job was already in flight; nothing was stored.
    Existing(T),
}

impl<T> Enqueued<T> {
    pub fn job(&self) -> &T {
        match self {
            Enqueued::Created(job) | Enqueued::Existing(job) => job,
        }
    }

    pub fn into_job(self) -> T {
        match self {
            Enqueued::Created(job) | Enqueued::Existing(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Enqueued::Created(_))
    }
}

/// Status shared by provisioning jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Ordered provisioning phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionPhase {
    AllocateStorage,
    CreateServer,
    AwaitReady,
    RegisterPool,
    Completed,
}

impl ProvisionPhase {
    pub fn next(self) -> Self {
        match self {
            ProvisionPhase::AllocateStorage => ProvisionPhase::CreateServer,
            ProvisionPhase::CreateServer => ProvisionPhase::AwaitReady,
            ProvisionPhase::AwaitReady => ProvisionPhase::RegisterPool,
            ProvisionPhase::RegisterPool | ProvisionPhase::Completed => ProvisionPhase::Completed,
        }
    }
}

/// One run of bringing a new pool online.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningJob {
    pub id: JobId,
    pub kind: PoolKind,
    pub max_instances: u32,
    pub priority: u32,
    pub owner: Option<PoolOwner>,
    pub resources: ResourceLimits,
    /// Id and name of the pool this job creates, fixed at enqueue time so
    /// every phase writes the same record.
    pub pool_id: PoolId,
    pub pool_name: String,
    pub phase: ProvisionPhase,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Completion marker of `allocate_storage`.
    pub volume: Option<VolumeHandle>,
    /// Completion marker of `create_server`.
    pub server: Option<ServerHandle>,
    /// Completion marker of `await_ready`.
    pub ready_at: Option<u64>,
    pub lease: Option<Lease>,
    pub deadline_at: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ProvisioningJob {
    /// Jobs with the same key are duplicates while in flight: one per
    /// kind for unowned pools, one per tenant for dedicated pools.
    pub fn dedupe_key(&self) -> String {
        match &self.owner {
            Some(owner) => format!("{}:{}", self.kind, owner.tenant_id),
            None => self.kind.to_string(),
        }
    }
}

impl JobRecord for ProvisioningJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    fn set_lease(&mut self, lease: Option<Lease>) {
        self.lease = lease;
    }

    fn touch(&mut self, now: u64) {
        self.updated_at = now;
    }
}

/// Ordered migration phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Preparing,
    ProvisioningTarget,
    Draining,
    Snapshotting,
    Transferring,
    Verifying,
    Cutover,
    Cleanup,
    Completed,
}

impl MigrationPhase {
    pub fn next(self) -> Self {
        match self {
            MigrationPhase::Preparing => MigrationPhase::ProvisioningTarget,
            MigrationPhase::ProvisioningTarget => MigrationPhase::Draining,
            MigrationPhase::Draining => MigrationPhase::Snapshotting,
            MigrationPhase::Snapshotting => MigrationPhase::Transferring,
            MigrationPhase::Transferring => MigrationPhase::Verifying,
            MigrationPhase::Verifying => MigrationPhase::Cutover,
            MigrationPhase::Cutover => MigrationPhase::Cleanup,
            MigrationPhase::Cleanup | MigrationPhase::Completed => MigrationPhase::Completed,
        }
    }

    /// Failures in these phases can still be rolled back.
    pub fn is_before_cutover(self) -> bool {
        self < MigrationPhase::Cutover
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Running,
    Completed,
    RolledBack,
    /// Failed at or after cutover; needs an operator.
    Failed,
}

impl MigrationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, MigrationStatus::Running)
    }
}

/// Moving one tenant to a pool of another kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationJob {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub customer_id: String,
    /// The allocation at the time the migration was requested.
    pub source: TenantAllocation,
    pub target_kind: PoolKind,
    pub phase: MigrationPhase,
    pub status: MigrationStatus,
    /// Reserved target, once `provisioning_target` succeeded.
    pub target: Option<TenantAllocation>,
    /// Pool holding a slot taken for this job that is not yet recorded as
    /// `target`. Set in the same transaction that takes the slot.
    #[serde(default)]
    pub target_hold: Option<PoolId>,
    /// Provisioning job backing the target, if one was needed.
    pub target_job_id: Option<JobId>,
    pub snapshot: Option<SnapshotRef>,
    pub downtime_started_at: Option<u64>,
    pub downtime_ended_at: Option<u64>,
    /// Set once cleanup gave the source slot back.
    #[serde(default)]
    pub source_released: bool,
    pub last_error: Option<String>,
    pub lease: Option<Lease>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl JobRecord for MigrationJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    fn set_lease(&mut self, lease: Option<Lease>) {
        self.lease = lease;
    }

    fn touch(&mut self, now: u64) {
        self.updated_at = now;
    }
}
