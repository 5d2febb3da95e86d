//! Collaborator doubles.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use pgfleet_core::*;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Volumes ───────────────────────────────────────────────────────

/// Volume provisioner that keeps volumes in a map keyed by name.
#[derive(Default)]
pub struct FakeVolumes {
    volumes: Mutex<HashMap<String, VolumeHandle>>,
    allocations: AtomicU32,
    calls: AtomicU32,
    failing: AtomicBool,
    allocate_delay: Mutex<Option<Duration>>,
}

impl FakeVolumes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `allocate_volume` calls that created a volume.
    pub fn allocations(&self) -> u32 {
        self.allocations.load(Ordering::SeqCst)
    }

    /// Every `allocate_volume` call, including ones that found the volume.
    pub fn allocate_calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every `allocate_volume` call.
    pub fn set_allocate_delay(&self, delay: Option<Duration>) {
        *lock(&self.allocate_delay) = delay;
    }
}

#[async_trait]
impl VolumeProvisioner for FakeVolumes {
    async fn find_volume(&self, name: &str) -> CollaboratorResult<Option<VolumeHandle>> {
        Ok(lock(&self.volumes).get(name).cloned())
    }

    async fn allocate_volume(&self, request: &VolumeRequest) -> CollaboratorResult<VolumeHandle> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.allocate_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable {
                service: "volumes",
                reason: "injected failure".to_string(),
            });
        }
        let mut volumes = lock(&self.volumes);
        if let Some(existing) = volumes.get(&request.name) {
            return Ok(existing.clone());
        }
        let n = self.allocations.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = VolumeHandle {
            id: format!("vol-{n}"),
            mount_path: format!("/mnt/pg/{}", request.name),
        };
        volumes.insert(request.name.clone(), handle.clone());
        Ok(handle)
    }
}

// ── Executor ──────────────────────────────────────────────────────

/// A tenant database created through [`FakeExecutor`].
#[derive(Debug, Clone)]
pub struct CreatedDatabase {
    pub server: Endpoint,
    pub identity: DatabaseIdentity,
    pub credentials: Credentials,
}

/// Workload executor that "starts" servers instantly and becomes ready
/// after a configurable number of readiness polls.
#[derive(Default)]
pub struct FakeExecutor {
    servers: Mutex<HashMap<String, ServerHandle>>,
    polls: Mutex<HashMap<String, u32>>,
    databases: Mutex<Vec<CreatedDatabase>>,
    starts: AtomicU32,
    ready_after: AtomicU32,
    never_ready: AtomicBool,
    fail_start: AtomicBool,
    fail_create_database: AtomicBool,
    create_delay: Mutex<Option<Duration>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report not-ready for the first `polls` readiness checks of each server.
    pub fn set_ready_after(&self, polls: u32) {
        self.ready_after.store(polls, Ordering::SeqCst);
    }

    pub fn set_never_ready(&self, never: bool) {
        self.never_ready.store(never, Ordering::SeqCst);
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_create_database(&self, fail: bool) {
        self.fail_create_database.store(fail, Ordering::SeqCst);
    }

    /// Delay every `create_database` call.
    pub fn set_create_delay(&self, delay: Option<Duration>) {
        *lock(&self.create_delay) = delay;
    }

    /// Number of `start_server` calls that started a server.
    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn databases(&self) -> Vec<CreatedDatabase> {
        lock(&self.databases).clone()
    }
}

#[async_trait]
impl WorkloadExecutor for FakeExecutor {
    async fn find_server(&self, name: &str) -> CollaboratorResult<Option<ServerHandle>> {
        Ok(lock(&self.servers).get(name).cloned())
    }

    async fn start_server(&self, spec: &ServerSpec) -> CollaboratorResult<ServerHandle> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable {
                service: "executor",
                reason: "injected failure".to_string(),
            });
        }
        let mut servers = lock(&self.servers);
        if let Some(existing) = servers.get(&spec.name) {
            return Ok(existing.clone());
        }
        let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = ServerHandle {
            executor_id: format!("exec-{n}"),
            host: format!("10.1.0.{n}"),
            port: 5432,
        };
        servers.insert(spec.name.clone(), handle.clone());
        Ok(handle)
    }

    async fn is_ready(&self, executor_id: &str) -> CollaboratorResult<bool> {
        if self.never_ready.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let mut polls = lock(&self.polls);
        let seen = polls.entry(executor_id.to_string()).or_insert(0);
        *seen += 1;
        Ok(*seen > self.ready_after.load(Ordering::SeqCst))
    }

    async fn create_database(
        &self,
        server: &Endpoint,
        identity: &DatabaseIdentity,
        credentials: CredentialHandle,
    ) -> CollaboratorResult<()> {
        let delay = *lock(&self.create_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create_database.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Rejected {
                service: "executor",
                reason: "injected failure".to_string(),
            });
        }
        let credentials = credentials.take()?;
        lock(&self.databases).push(CreatedDatabase {
            server: server.clone(),
            identity: identity.clone(),
            credentials,
        });
        Ok(())
    }
}

// ── Tenant workload ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadEvent {
    Paused(String),
    /// `target` is set when the workload was repointed.
    Resumed {
        tenant_id: String,
        target: Option<Endpoint>,
    },
}

#[derive(Default)]
pub struct FakeWorkload {
    events: Mutex<Vec<WorkloadEvent>>,
    fail_pause: AtomicBool,
    fail_repoint: AtomicBool,
}

impl FakeWorkload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<WorkloadEvent> {
        lock(&self.events).clone()
    }

    pub fn set_fail_pause(&self, fail: bool) {
        self.fail_pause.store(fail, Ordering::SeqCst);
    }

    /// Fail `resume_writes` calls that carry a repoint.
    pub fn set_fail_repoint(&self, fail: bool) {
        self.fail_repoint.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TenantWorkload for FakeWorkload {
    async fn pause_writes(&self, tenant_id: &str) -> CollaboratorResult<()> {
        if self.fail_pause.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable {
                service: "workload",
                reason: "injected failure".to_string(),
            });
        }
        lock(&self.events).push(WorkloadEvent::Paused(tenant_id.to_string()));
        Ok(())
    }

    async fn resume_writes(
        &self,
        tenant_id: &str,
        repoint: Option<Repoint>,
    ) -> CollaboratorResult<()> {
        let target = match repoint {
            Some(repoint) => {
                if self.fail_repoint.load(Ordering::SeqCst) {
                    return Err(CollaboratorError::Unavailable {
                        service: "workload",
                        reason: "injected failure".to_string(),
                    });
                }
                repoint.credentials.take()?;
                Some(repoint.endpoint)
            }
            None => None,
        };
        lock(&self.events).push(WorkloadEvent::Resumed {
            tenant_id: tenant_id.to_string(),
            target,
        });
        Ok(())
    }
}

// ── Data mover ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoverStep {
    Export,
    Import,
    Verify,
}

#[derive(Default)]
pub struct FakeMover {
    fail_at: Mutex<Option<MoverStep>>,
    mismatch: AtomicBool,
    calls: Mutex<Vec<MoverStep>>,
}

impl FakeMover {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_at(&self, step: Option<MoverStep>) {
        *lock(&self.fail_at) = step;
    }

    /// Make `verify` report differing row counts.
    pub fn set_mismatch(&self, mismatch: bool) {
        self.mismatch.store(mismatch, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<MoverStep> {
        lock(&self.calls).clone()
    }

    fn step(&self, step: MoverStep) -> CollaboratorResult<()> {
        lock(&self.calls).push(step);
        if *lock(&self.fail_at) == Some(step) {
            return Err(CollaboratorError::Unavailable {
                service: "mover",
                reason: format!("injected failure at {step:?}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DataMover for FakeMover {
    async fn export(
        &self,
        tenant_id: &str,
        _source: &DatabaseLocation,
    ) -> CollaboratorResult<SnapshotRef> {
        self.step(MoverStep::Export)?;
        Ok(SnapshotRef {
            id: format!("snap-{tenant_id}"),
            size_bytes: 4096,
        })
    }

    async fn import(
        &self,
        _snapshot: &SnapshotRef,
        _target: &DatabaseLocation,
    ) -> CollaboratorResult<()> {
        self.step(MoverStep::Import)
    }

    async fn verify(
        &self,
        _source: &DatabaseLocation,
        _target: &DatabaseLocation,
    ) -> CollaboratorResult<VerifyReport> {
        self.step(MoverStep::Verify)?;
        let target_rows = if self.mismatch.load(Ordering::SeqCst) { 99 } else { 100 };
        Ok(VerifyReport {
            source_tables: 3,
            target_tables: 3,
            source_rows: 100,
            target_rows,
        })
    }
}

// ── Entitlements ──────────────────────────────────────────────────

/// Entitlement source backed by a map; counts full lookups.
#[derive(Default)]
pub struct StaticEntitlements {
    plans: Mutex<HashMap<String, Entitlement>>,
    lookups: AtomicU32,
    versioned: AtomicBool,
}

impl StaticEntitlements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, entitlement: Entitlement) -> Self {
        self.set(entitlement);
        self
    }

    pub fn set(&self, entitlement: Entitlement) {
        lock(&self.plans).insert(entitlement.customer_id.clone(), entitlement);
    }

    /// Answer `version` queries instead of deferring to full lookups.
    pub fn set_versioned(&self, versioned: bool) {
        self.versioned.store(versioned, Ordering::SeqCst);
    }

    pub fn lookups(&self) -> u32 {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EntitlementSource for StaticEntitlements {
    async fn entitlement(&self, customer_id: &str) -> CollaboratorResult<Entitlement> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        lock(&self.plans)
            .get(customer_id)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(format!("customer {customer_id}")))
    }

    async fn version(&self, customer_id: &str) -> CollaboratorResult<Option<String>> {
        if !self.versioned.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(lock(&self.plans).get(customer_id).map(|e| e.version.clone()))
    }
}

// ── Prober ────────────────────────────────────────────────────────

/// Prober with scripted per-address results.
///
/// Scripted results are consumed in order; once a script runs out the
/// default result applies.
pub struct FakeProber {
    scripts: Mutex<HashMap<String, VecDeque<bool>>>,
    default_alive: AtomicBool,
    probes: AtomicU32,
}

impl Default for FakeProber {
    fn default() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_alive: AtomicBool::new(true),
            probes: AtomicU32::new(0),
        }
    }
}

impl FakeProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, endpoint: &Endpoint, results: impl IntoIterator<Item = bool>) {
        lock(&self.scripts).insert(endpoint.address(), results.into_iter().collect());
    }

    pub fn set_default_alive(&self, alive: bool) {
        self.default_alive.store(alive, Ordering::SeqCst);
    }

    pub fn probes(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PoolProber for FakeProber {
    async fn probe(&self, endpoint: &Endpoint) -> CollaboratorResult<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let scripted = lock(&self.scripts)
            .get_mut(&endpoint.address())
            .and_then(|q| q.pop_front());
        let alive = scripted.unwrap_or_else(|| self.default_alive.load(Ordering::SeqCst));
        if alive {
            Ok(())
        } else {
            Err(CollaboratorError::Unavailable {
                service: "postgres",
                reason: format!("{} refused connection", endpoint.address()),
            })
        }
    }
}
