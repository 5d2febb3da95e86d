//! StateStore: redb-backed pool registry.
//!
//! Provides typed operations over pools, tenant allocations, provisioning
//! jobs, and migration jobs. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).
//!
//! redb runs one write transaction at a time, so every read-check-write
//! sequence executed inside a single write transaction is atomic with
//! respect to all other writers sharing the database. The guarded updates
//! below ([`StateStore::update_pool`], the enqueue and claim operations,
//! and [`StateStore::swap_allocation`]) rely on this.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use pgfleet_core::epoch_secs;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Result of a guarded pool update.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolUpdate {
    /// The record as stored after the call.
    pub record: PoolRecord,
    /// Whether the guard allowed the write.
    pub applied: bool,
}

/// Thread-safe registry backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent registry at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory registry (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(POOLS).map_err(map_err!(Table))?;
        txn.open_table(TENANTS).map_err(map_err!(Table))?;
        txn.open_table(PROVISIONING_JOBS).map_err(map_err!(Table))?;
        txn.open_table(MIGRATION_JOBS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON access ────────────────────────────────────────

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = encode(value)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        read_one(&table, key)
    }

    fn list_json<T: DeserializeOwned>(&self, def: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        read_all(&table)
    }

    /// Read-modify-write of one record inside a single write transaction.
    ///
    /// `f` returns `Ok(false)` to leave the record untouched (the
    /// transaction is aborted). Returns `None` if the key is absent.
    fn update_json<T, F>(&self, def: JsonTable, key: &str, f: F) -> StateResult<Option<(T, bool)>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> StateResult<bool>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let Some(mut record) = read_one::<T, _>(&table, key)? else {
                drop(table);
                txn.abort().map_err(map_err!(Transaction))?;
                return Ok(None);
            };
            if !f(&mut record)? {
                drop(table);
                txn.abort().map_err(map_err!(Transaction))?;
                return Ok(Some((record, false)));
            }
            let bytes = encode(&record)?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(Some((outcome, true)))
    }

    /// Claim a job for `worker` if it is not terminal and no other worker
    /// holds a live lease on it.
    fn claim_json<T>(&self, def: JsonTable, key: &str, worker: &str, lease_secs: u64) -> StateResult<Option<T>>
    where
        T: JobRecord + Serialize + DeserializeOwned,
    {
        let now = epoch_secs();
        let claimed = self.update_json::<T, _>(def, key, |job| {
            if job.is_terminal() || job.lease().is_some_and(|l| l.blocks(worker, now)) {
                return Ok(false);
            }
            job.set_lease(Some(Lease {
                owner: worker.to_string(),
                expires_at: now + lease_secs,
            }));
            job.touch(now);
            Ok(true)
        })?;
        Ok(claimed.and_then(|(job, applied)| applied.then_some(job)))
    }

    /// Overwrite a job only while `owner` still holds its lease.
    ///
    /// Fails with `Conflict` when the stored lease belongs to someone else
    /// (or was dropped), so a driver that lost its lease cannot clobber
    /// the new owner's progress.
    fn save_leased_json<T>(&self, def: JsonTable, job: &T, owner: &str) -> StateResult<()>
    where
        T: JobRecord + Clone + Serialize + DeserializeOwned,
    {
        let saved = self.update_json::<T, _>(def, job.id(), |stored| {
            if !stored.lease().is_some_and(|l| l.owner == owner) {
                return Err(StateError::Conflict(format!(
                    "job {} is no longer leased to {owner}",
                    job.id()
                )));
            }
            *stored = job.clone();
            Ok(true)
        })?;
        match saved {
            Some(_) => Ok(()),
            None => Err(StateError::NotFound(format!("job {}", job.id()))),
        }
    }

    /// Claim the oldest claimable job in a table.
    fn claim_next_json<T>(&self, def: JsonTable, worker: &str, lease_secs: u64) -> StateResult<Option<T>>
    where
        T: JobRecord + Serialize + DeserializeOwned + HasCreatedAt,
    {
        let now = epoch_secs();
        let mut candidates: Vec<T> = self
            .list_json::<T>(def)?
            .into_iter()
            .filter(|job| !job.is_terminal() && !job.lease().is_some_and(|l| l.blocks(worker, now)))
            .collect();
        candidates.sort_by_key(|job| job.created_at());

        // Another worker may win the race between the scan and the claim;
        // fall through to the next candidate when that happens.
        for candidate in candidates {
            if let Some(job) = self.claim_json::<T>(def, candidate.id(), worker, lease_secs)? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    // ── Pools ──────────────────────────────────────────────────────

    /// Insert or update a pool record.
    ///
    /// Rejects records that break `0 < max_instances` or
    /// `current_instances <= max_instances`.
    pub fn put_pool(&self, pool: &PoolRecord) -> StateResult<()> {
        validate_pool(pool)?;
        self.put_json(POOLS, &pool.id, pool)?;
        debug!(pool_id = %pool.id, status = pool.status.as_str(), "pool stored");
        Ok(())
    }

    /// Get a pool by ID.
    pub fn get_pool(&self, pool_id: &str) -> StateResult<Option<PoolRecord>> {
        self.get_json(POOLS, pool_id)
    }

    /// List pools matching a filter.
    pub fn list_pools(&self, filter: &PoolFilter) -> StateResult<Vec<PoolRecord>> {
        let mut pools: Vec<PoolRecord> = self
            .list_json::<PoolRecord>(POOLS)?
            .into_iter()
            .filter(|p| filter.matches(p))
            .collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pools)
    }

    /// Allocatable pools of a kind, best candidate first.
    ///
    /// Candidates are `active`, `healthy`/`unknown`, and below capacity.
    /// Ordering is priority ascending, then current load ascending, then
    /// name for a stable tie-break.
    pub fn find_candidates(
        &self,
        kind: PoolKind,
        filter: &CandidateFilter,
    ) -> StateResult<Vec<PoolRecord>> {
        let mut candidates: Vec<PoolRecord> = self
            .list_json::<PoolRecord>(POOLS)?
            .into_iter()
            .filter(|p| p.kind == kind && p.is_allocatable())
            .filter(|p| match (&filter.owner_tenant, &p.owner) {
                (Some(tenant), Some(owner)) => &owner.tenant_id == tenant,
                (None, None) => true,
                _ => false,
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.current_instances.cmp(&b.current_instances))
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(candidates)
    }

    /// Apply a guarded mutation to one pool in a single write transaction.
    ///
    /// The closure returns `false` to leave the record unchanged. A
    /// mutation that would break the capacity invariant is rejected with
    /// [`StateError::CapacityExceeded`] and nothing is written.
    pub fn update_pool<F>(&self, pool_id: &str, f: F) -> StateResult<PoolUpdate>
    where
        F: FnOnce(&mut PoolRecord) -> bool,
    {
        let now = epoch_secs();
        let outcome = self.update_json::<PoolRecord, _>(POOLS, pool_id, |pool| {
            if !f(pool) {
                return Ok(false);
            }
            validate_pool(pool)?;
            pool.updated_at = now;
            Ok(true)
        })?;
        match outcome {
            Some((record, applied)) => Ok(PoolUpdate { record, applied }),
            None => Err(StateError::NotFound(format!("pool {pool_id}"))),
        }
    }

    // ── Tenant allocations ─────────────────────────────────────────

    /// Record a new tenant allocation. Fails with `Conflict` if the tenant
    /// already has one.
    pub fn insert_allocation(&self, allocation: &TenantAllocation) -> StateResult<()> {
        let bytes = encode(allocation)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TENANTS).map_err(map_err!(Table))?;
            let exists = table
                .get(allocation.tenant_id.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if exists {
                drop(table);
                txn.abort().map_err(map_err!(Transaction))?;
                return Err(StateError::Conflict(format!(
                    "tenant {} is already allocated",
                    allocation.tenant_id
                )));
            }
            table
                .insert(allocation.tenant_id.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(tenant_id = %allocation.tenant_id, pool_id = %allocation.pool_id, "allocation stored");
        Ok(())
    }

    pub fn get_allocation(&self, tenant_id: &str) -> StateResult<Option<TenantAllocation>> {
        self.get_json(TENANTS, tenant_id)
    }

    pub fn list_allocations(&self) -> StateResult<Vec<TenantAllocation>> {
        self.list_json(TENANTS)
    }

    /// Number of tenants currently pointing at a pool.
    pub fn count_allocations_on_pool(&self, pool_id: &str) -> StateResult<u32> {
        let count = self
            .list_allocations()?
            .iter()
            .filter(|a| a.pool_id == pool_id)
            .count();
        Ok(count as u32)
    }

    /// Atomically repoint a tenant, provided the stored allocation is
    /// still at `expected_generation`. Readers see either the old or the
    /// new allocation, never a mix.
    pub fn swap_allocation(
        &self,
        tenant_id: &str,
        expected_generation: u64,
        mut replacement: TenantAllocation,
    ) -> StateResult<TenantAllocation> {
        let outcome = self.update_json::<TenantAllocation, _>(TENANTS, tenant_id, |current| {
            if current.generation != expected_generation {
                return Err(StateError::Conflict(format!(
                    "tenant {tenant_id} is at generation {}, expected {expected_generation}",
                    current.generation
                )));
            }
            replacement.tenant_id = tenant_id.to_string();
            replacement.generation = expected_generation + 1;
            *current = replacement;
            Ok(true)
        })?;
        match outcome {
            Some((allocation, _)) => {
                debug!(%tenant_id, pool_id = %allocation.pool_id, generation = allocation.generation, "allocation swapped");
                Ok(allocation)
            }
            None => Err(StateError::NotFound(format!("tenant {tenant_id}"))),
        }
    }

    /// Remove a tenant allocation. Returns true if it existed.
    pub fn delete_allocation(&self, tenant_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(TENANTS).map_err(map_err!(Table))?;
            existed = table.remove(tenant_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Provisioning jobs ──────────────────────────────────────────

    /// Store a provisioning job unless an equivalent one is in flight.
    ///
    /// The in-flight check and the insert share one write transaction, so
    /// concurrent callers enqueue at most one job per dedupe key.
    pub fn enqueue_provisioning(&self, job: ProvisioningJob) -> StateResult<Enqueued<ProvisioningJob>> {
        let key = job.dedupe_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PROVISIONING_JOBS).map_err(map_err!(Table))?;
            let existing = read_all::<ProvisioningJob, _>(&table)?
                .into_iter()
                .find(|j| !j.status.is_terminal() && j.dedupe_key() == key);
            if let Some(existing) = existing {
                drop(table);
                txn.abort().map_err(map_err!(Transaction))?;
                debug!(job_id = %existing.id, dedupe_key = %key, "provisioning already in flight");
                return Ok(Enqueued::Existing(existing));
            }
            let bytes = encode(&job)?;
            table
                .insert(job.id.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(job_id = %job.id, dedupe_key = %key, "provisioning job enqueued");
        Ok(Enqueued::Created(job))
    }

    /// Overwrite a provisioning job.
    pub fn put_provisioning_job(&self, job: &ProvisioningJob) -> StateResult<()> {
        self.put_json(PROVISIONING_JOBS, &job.id, job)
    }

    /// Persist progress of a provisioning job held under `owner`'s lease.
    pub fn save_provisioning_job(&self, job: &ProvisioningJob, owner: &str) -> StateResult<()> {
        self.save_leased_json(PROVISIONING_JOBS, job, owner)
    }

    pub fn get_provisioning_job(&self, job_id: &str) -> StateResult<Option<ProvisioningJob>> {
        self.get_json(PROVISIONING_JOBS, job_id)
    }

    pub fn list_provisioning_jobs(&self) -> StateResult<Vec<ProvisioningJob>> {
        self.list_json(PROVISIONING_JOBS)
    }

    /// Take (or renew) the lease on one provisioning job.
    pub fn claim_provisioning_job(
        &self,
        job_id: &str,
        worker: &str,
        lease_secs: u64,
    ) -> StateResult<Option<ProvisioningJob>> {
        self.claim_json(PROVISIONING_JOBS, job_id, worker, lease_secs)
    }

    /// Take the lease on the oldest runnable provisioning job.
    pub fn claim_next_provisioning_job(
        &self,
        worker: &str,
        lease_secs: u64,
    ) -> StateResult<Option<ProvisioningJob>> {
        self.claim_next_json(PROVISIONING_JOBS, worker, lease_secs)
    }

    // ── Migration jobs ─────────────────────────────────────────────

    /// Store a new migration job. Fails with `Conflict` if the tenant
    /// already has a migration in flight.
    pub fn insert_migration_job(&self, job: &MigrationJob) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(MIGRATION_JOBS).map_err(map_err!(Table))?;
            let busy = read_all::<MigrationJob, _>(&table)?
                .into_iter()
                .any(|j| j.tenant_id == job.tenant_id && !j.status.is_terminal());
            if busy {
                drop(table);
                txn.abort().map_err(map_err!(Transaction))?;
                return Err(StateError::Conflict(format!(
                    "tenant {} already has a migration in flight",
                    job.tenant_id
                )));
            }
            let bytes = encode(job)?;
            table
                .insert(job.id.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(job_id = %job.id, tenant_id = %job.tenant_id, "migration job stored");
        Ok(())
    }

    /// Overwrite a migration job.
    pub fn put_migration_job(&self, job: &MigrationJob) -> StateResult<()> {
        self.put_json(MIGRATION_JOBS, &job.id, job)
    }

    /// Persist progress of a migration job held under `owner`'s lease.
    pub fn save_migration_job(&self, job: &MigrationJob, owner: &str) -> StateResult<()> {
        self.save_leased_json(MIGRATION_JOBS, job, owner)
    }

    pub fn get_migration_job(&self, job_id: &str) -> StateResult<Option<MigrationJob>> {
        self.get_json(MIGRATION_JOBS, job_id)
    }

    pub fn list_migration_jobs(&self) -> StateResult<Vec<MigrationJob>> {
        self.list_json(MIGRATION_JOBS)
    }

    /// Take one slot on `pool_id` for a migration job and record it as the
    /// job's `target_hold`, both in one write transaction.
    ///
    /// Returns `false` (and changes nothing) when the pool is not `active`
    /// or has no room. Fails with `Conflict` unless `owner` holds the job's
    /// lease and the job holds no slot yet.
    pub fn hold_migration_slot(&self, job_id: &str, owner: &str, pool_id: &str) -> StateResult<bool> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let held = {
            let mut jobs = txn.open_table(MIGRATION_JOBS).map_err(map_err!(Table))?;
            let mut pools = txn.open_table(POOLS).map_err(map_err!(Table))?;
            let mut job = leased_migration_job(&jobs, job_id, owner)?;
            if let Some(held) = &job.target_hold {
                return Err(StateError::Conflict(format!(
                    "migration job {job_id} already holds a slot on pool {held}"
                )));
            }
            let mut pool: PoolRecord = read_one(&pools, pool_id)?
                .ok_or_else(|| StateError::NotFound(format!("pool {pool_id}")))?;

            if pool.status == PoolStatus::Active && pool.has_capacity() {
                pool.current_instances += 1;
                pool.status = pool.capacity_status();
                pool.updated_at = now;
                job.target_hold = Some(pool_id.to_string());
                job.updated_at = now;
                let pool_bytes = encode(&pool)?;
                let job_bytes = encode(&job)?;
                pools
                    .insert(pool_id, pool_bytes.as_slice())
                    .map_err(map_err!(Write))?;
                jobs.insert(job_id, job_bytes.as_slice())
                    .map_err(map_err!(Write))?;
                true
            } else {
                false
            }
        };
        if held {
            txn.commit().map_err(map_err!(Transaction))?;
            debug!(job_id, pool_id, "migration slot held");
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        Ok(held)
    }

    /// Give back the slot a migration job holds, clearing `target_hold` in
    /// the same transaction. Returns the pool the slot was on, if any.
    pub fn release_migration_hold(&self, job_id: &str, owner: &str) -> StateResult<Option<PoolId>> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released = {
            let mut jobs = txn.open_table(MIGRATION_JOBS).map_err(map_err!(Table))?;
            let mut pools = txn.open_table(POOLS).map_err(map_err!(Table))?;
            let mut job = leased_migration_job(&jobs, job_id, owner)?;
            match job.target_hold.take() {
                None => None,
                Some(pool_id) => {
                    let pool: Option<PoolRecord> = read_one(&pools, &pool_id)?;
                    if let Some(mut pool) = pool.filter(|p| p.current_instances > 0) {
                        pool.current_instances -= 1;
                        pool.status = pool.capacity_status();
                        pool.updated_at = now;
                        let bytes = encode(&pool)?;
                        pools
                            .insert(pool_id.as_str(), bytes.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    job.updated_at = now;
                    let bytes = encode(&job)?;
                    jobs.insert(job_id, bytes.as_slice())
                        .map_err(map_err!(Write))?;
                    Some(pool_id)
                }
            }
        };
        match &released {
            Some(pool_id) => {
                txn.commit().map_err(map_err!(Transaction))?;
                debug!(job_id, %pool_id, "migration slot hold released");
            }
            None => txn.abort().map_err(map_err!(Transaction))?,
        }
        Ok(released)
    }

    pub fn claim_migration_job(
        &self,
        job_id: &str,
        worker: &str,
        lease_secs: u64,
    ) -> StateResult<Option<MigrationJob>> {
        self.claim_json(MIGRATION_JOBS, job_id, worker, lease_secs)
    }

    pub fn claim_next_migration_job(
        &self,
        worker: &str,
        lease_secs: u64,
    ) -> StateResult<Option<MigrationJob>> {
        self.claim_next_json(MIGRATION_JOBS, worker, lease_secs)
    }
}

/// Creation time accessor used to claim jobs oldest-first.
pub trait HasCreatedAt {
    fn created_at(&self) -> u64;
}

impl HasCreatedAt for ProvisioningJob {
    fn created_at(&self) -> u64 {
        self.created_at
    }
}

impl HasCreatedAt for MigrationJob {
    fn created_at(&self) -> u64 {
        self.created_at
    }
}

/// Read a migration job that `owner` must hold the lease on.
fn leased_migration_job<R>(table: &R, job_id: &str, owner: &str) -> StateResult<MigrationJob>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let job: MigrationJob = read_one(table, job_id)?
        .ok_or_else(|| StateError::NotFound(format!("migration job {job_id}")))?;
    if !job.lease.as_ref().is_some_and(|l| l.owner == owner) {
        return Err(StateError::Conflict(format!(
            "migration job {job_id} is no longer leased to {owner}"
        )));
    }
    Ok(job)
}

fn validate_pool(pool: &PoolRecord) -> StateResult<()> {
    if pool.max_instances == 0 {
        return Err(StateError::Invalid(format!(
            "pool {} must allow at least one instance",
            pool.id
        )));
    }
    if pool.current_instances > pool.max_instances {
        return Err(StateError::CapacityExceeded {
            pool_id: pool.id.clone(),
            current: pool.current_instances,
            max: pool.max_instances,
        });
    }
    Ok(())
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn read_one<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value: T = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn read_all<T, R>(table: &R) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let record: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        results.push(record);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    // ── Pool CRUD ──────────────────────────────────────────────────

    #[test]
    fn pool_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let pool = shared_pool("pool-1", 0, 50);

        store.put_pool(&pool).unwrap();
        let retrieved = store.get_pool("pool-1").unwrap();

        assert_eq!(retrieved, Some(pool));
    }

    #[test]
    fn pool_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_pool("nope").unwrap().is_none());
    }

    #[test]
    fn put_pool_rejects_overfull_record() {
        let store = StateStore::open_in_memory().unwrap();
        let pool = shared_pool("pool-1", 51, 50);

        let err = store.put_pool(&pool).unwrap_err();
        assert!(matches!(err, StateError::CapacityExceeded { current: 51, max: 50, .. }));
        assert!(store.get_pool("pool-1").unwrap().is_none());
    }

    #[test]
    fn put_pool_rejects_zero_capacity() {
        let store = StateStore::open_in_memory().unwrap();
        let pool = shared_pool("pool-1", 0, 0);
        assert!(matches!(store.put_pool(&pool), Err(StateError::Invalid(_))));
    }

    #[test]
    fn list_pools_applies_filter() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_pool(&shared_pool("a", 0, 50)).unwrap();
        let mut full = shared_pool("b", 50, 50);
        full.status = PoolStatus::Full;
        store.put_pool(&full).unwrap();
        store.put_pool(&dedicated_pool("c", "tenant-9")).unwrap();

        assert_eq!(store.list_pools(&PoolFilter::default()).unwrap().len(), 3);

        let full_only = store
            .list_pools(&PoolFilter {
                status: Some(PoolStatus::Full),
                kind: None,
            })
            .unwrap();
        assert_eq!(full_only.len(), 1);
        assert_eq!(full_only[0].id, "b");

        let dedicated = store
            .list_pools(&PoolFilter {
                status: None,
                kind: Some(PoolKind::Dedicated),
            })
            .unwrap();
        assert_eq!(dedicated.len(), 1);
    }

    // ── Candidate selection ────────────────────────────────────────

    #[test]
    fn candidates_order_by_priority_then_load() {
        let store = StateStore::open_in_memory().unwrap();

        let mut low_priority_busy = shared_pool("p1", 40, 50);
        low_priority_busy.priority = 10;
        let mut low_priority_idle = shared_pool("p2", 5, 50);
        low_priority_idle.priority = 10;
        let mut high_priority_idle = shared_pool("p3", 0, 50);
        high_priority_idle.priority = 20;

        store.put_pool(&high_priority_idle).unwrap();
        store.put_pool(&low_priority_busy).unwrap();
        store.put_pool(&low_priority_idle).unwrap();

        let ids: Vec<String> = store
            .find_candidates(PoolKind::Shared, &CandidateFilter::default())
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["p2", "p1", "p3"]);
    }

    #[test]
    fn candidates_exclude_full_unhealthy_and_inactive() {
        let store = StateStore::open_in_memory().unwrap();

        let mut full = shared_pool("full", 50, 50);
        full.status = PoolStatus::Full;
        let mut sick = shared_pool("sick", 0, 50);
        sick.health = HealthStatus::Unhealthy;
        let mut degraded = shared_pool("degraded", 0, 50);
        degraded.health = HealthStatus::Degraded;
        let mut booting = shared_pool("booting", 0, 50);
        booting.status = PoolStatus::Initializing;
        let mut fresh = shared_pool("fresh", 0, 50);
        fresh.health = HealthStatus::Unknown;

        for p in [&full, &sick, &degraded, &booting, &fresh] {
            store.put_pool(p).unwrap();
        }
        store.put_pool(&dedicated_pool("mine", "tenant-1")).unwrap();

        let candidates = store
            .find_candidates(PoolKind::Shared, &CandidateFilter::default())
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "fresh");
    }

    #[test]
    fn dedicated_candidates_are_scoped_to_owner() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_pool(&dedicated_pool("d1", "tenant-1")).unwrap();
        store.put_pool(&dedicated_pool("d2", "tenant-2")).unwrap();

        let filter = CandidateFilter {
            owner_tenant: Some("tenant-2".to_string()),
        };
        let candidates = store.find_candidates(PoolKind::Dedicated, &filter).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "d2");

        let unowned = store
            .find_candidates(PoolKind::Dedicated, &CandidateFilter::default())
            .unwrap();
        assert!(unowned.is_empty());
    }

    // ── Guarded updates ────────────────────────────────────────────

    #[test]
    fn update_pool_applies_and_stamps() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_pool(&shared_pool("pool-1", 0, 50)).unwrap();

        let update = store
            .update_pool("pool-1", |p| {
                p.priority = 5;
                true
            })
            .unwrap();
        assert!(update.applied);
        assert_eq!(update.record.priority, 5);
        assert!(update.record.updated_at >= 1000);
        assert_eq!(store.get_pool("pool-1").unwrap().unwrap().priority, 5);
    }

    #[test]
    fn update_pool_guard_false_writes_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_pool(&shared_pool("pool-1", 0, 50)).unwrap();

        let update = store
            .update_pool("pool-1", |p| {
                p.priority = 5;
                false
            })
            .unwrap();
        assert!(!update.applied);
        assert_eq!(store.get_pool("pool-1").unwrap().unwrap().priority, 100);
    }

    #[test]
    fn update_pool_rejects_invariant_violation() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_pool(&shared_pool("pool-1", 50, 50)).unwrap();

        let err = store
            .update_pool("pool-1", |p| {
                p.current_instances += 1;
                true
            })
            .unwrap_err();
        assert!(matches!(err, StateError::CapacityExceeded { .. }));
        assert_eq!(store.get_pool("pool-1").unwrap().unwrap().current_instances, 50);
    }

    #[test]
    fn update_missing_pool_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(matches!(
            store.update_pool("ghost", |_| true),
            Err(StateError::NotFound(_))
        ));
    }

    // ── Tenant allocations ─────────────────────────────────────────

    #[test]
    fn allocation_insert_is_exclusive() {
        let store = StateStore::open_in_memory().unwrap();
        let alloc = allocation("tenant-1", "pool-1");

        store.insert_allocation(&alloc).unwrap();
        assert!(matches!(
            store.insert_allocation(&alloc),
            Err(StateError::Conflict(_))
        ));
        assert_eq!(store.get_allocation("tenant-1").unwrap(), Some(alloc));
    }

    #[test]
    fn swap_allocation_checks_generation() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_allocation(&allocation("tenant-1", "pool-1")).unwrap();

        let replacement = allocation("tenant-1", "pool-2");
        let swapped = store.swap_allocation("tenant-1", 0, replacement.clone()).unwrap();
        assert_eq!(swapped.pool_id, "pool-2");
        assert_eq!(swapped.generation, 1);

        // Stale generation loses.
        let err = store.swap_allocation("tenant-1", 0, replacement).unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));
        assert_eq!(store.get_allocation("tenant-1").unwrap().unwrap().pool_id, "pool-2");
    }

    #[test]
    fn count_allocations_per_pool() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_allocation(&allocation("t1", "pool-1")).unwrap();
        store.insert_allocation(&allocation("t2", "pool-1")).unwrap();
        store.insert_allocation(&allocation("t3", "pool-2")).unwrap();

        assert_eq!(store.count_allocations_on_pool("pool-1").unwrap(), 2);
        assert_eq!(store.count_allocations_on_pool("pool-3").unwrap(), 0);

        assert!(store.delete_allocation("t1").unwrap());
        assert_eq!(store.count_allocations_on_pool("pool-1").unwrap(), 1);
    }

    // ── Provisioning jobs ──────────────────────────────────────────

    #[test]
    fn enqueue_dedupes_per_kind() {
        let store = StateStore::open_in_memory().unwrap();

        let first = store.enqueue_provisioning(provisioning_job("job-1", None)).unwrap();
        assert!(first.is_created());

        let second = store.enqueue_provisioning(provisioning_job("job-2", None)).unwrap();
        assert!(!second.is_created());
        assert_eq!(second.job().id, "job-1");

        assert_eq!(store.list_provisioning_jobs().unwrap().len(), 1);
    }

    #[test]
    fn enqueue_allows_new_job_after_terminal() {
        let store = StateStore::open_in_memory().unwrap();
        let mut job = store
            .enqueue_provisioning(provisioning_job("job-1", None))
            .unwrap()
            .into_job();
        job.status = JobStatus::Failed;
        store.put_provisioning_job(&job).unwrap();

        let again = store.enqueue_provisioning(provisioning_job("job-2", None)).unwrap();
        assert!(again.is_created());
    }

    #[test]
    fn enqueue_dedupes_dedicated_per_tenant() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store
            .enqueue_provisioning(provisioning_job("job-a", Some("tenant-a")))
            .unwrap();
        let b = store
            .enqueue_provisioning(provisioning_job("job-b", Some("tenant-b")))
            .unwrap();
        let a2 = store
            .enqueue_provisioning(provisioning_job("job-a2", Some("tenant-a")))
            .unwrap();
        assert!(a.is_created());
        assert!(b.is_created());
        assert!(!a2.is_created());
    }

    #[test]
    fn concurrent_enqueue_creates_one_job() {
        let store = StateStore::open_in_memory().unwrap();
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .enqueue_provisioning(provisioning_job(&format!("job-{i}"), None))
                        .unwrap()
                        .is_created()
                })
            })
            .collect();
        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|c| *c)
            .count();
        assert_eq!(created, 1);
        assert_eq!(store.list_provisioning_jobs().unwrap().len(), 1);
    }

    #[test]
    fn claim_respects_live_leases() {
        let store = StateStore::open_in_memory().unwrap();
        store.enqueue_provisioning(provisioning_job("job-1", None)).unwrap();

        let claimed = store.claim_provisioning_job("job-1", "worker-a", 60).unwrap();
        assert_eq!(claimed.unwrap().lease.unwrap().owner, "worker-a");

        // Another worker is locked out; the owner may renew.
        assert!(store.claim_provisioning_job("job-1", "worker-b", 60).unwrap().is_none());
        assert!(store.claim_next_provisioning_job("worker-b", 60).unwrap().is_none());
        assert!(store.claim_provisioning_job("job-1", "worker-a", 60).unwrap().is_some());
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let store = StateStore::open_in_memory().unwrap();
        let mut job = provisioning_job("job-1", None);
        job.lease = Some(Lease {
            owner: "crashed".to_string(),
            expires_at: 1,
        });
        store.put_provisioning_job(&job).unwrap();

        let claimed = store.claim_next_provisioning_job("worker-b", 60).unwrap().unwrap();
        assert_eq!(claimed.id, "job-1");
        assert_eq!(claimed.lease.unwrap().owner, "worker-b");
    }

    #[test]
    fn save_requires_the_current_lease() {
        let store = StateStore::open_in_memory().unwrap();
        store.enqueue_provisioning(provisioning_job("job-1", None)).unwrap();
        let mut job = store.claim_provisioning_job("job-1", "worker-a", 60).unwrap().unwrap();

        job.attempts = 1;
        store.save_provisioning_job(&job, "worker-a").unwrap();
        assert_eq!(store.get_provisioning_job("job-1").unwrap().unwrap().attempts, 1);

        // worker-b took the job over after worker-a's lease ran out.
        let mut stale = job.clone();
        stale.lease = stale.lease.map(|l| Lease { expires_at: 1, ..l });
        store.put_provisioning_job(&stale).unwrap();
        store.claim_provisioning_job("job-1", "worker-b", 60).unwrap().unwrap();

        job.attempts = 2;
        assert!(matches!(
            store.save_provisioning_job(&job, "worker-a"),
            Err(StateError::Conflict(_))
        ));
        let stored = store.get_provisioning_job("job-1").unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.lease.unwrap().owner, "worker-b");

        assert!(matches!(
            store.save_provisioning_job(&provisioning_job("ghost", None), "worker-a"),
            Err(StateError::NotFound(_))
        ));
    }

    #[test]
    fn terminal_jobs_are_never_claimed() {
        let store = StateStore::open_in_memory().unwrap();
        let mut job = provisioning_job("job-1", None);
        job.status = JobStatus::Completed;
        store.put_provisioning_job(&job).unwrap();

        assert!(store.claim_provisioning_job("job-1", "w", 60).unwrap().is_none());
        assert!(store.claim_next_provisioning_job("w", 60).unwrap().is_none());
    }

    // ── Migration jobs ─────────────────────────────────────────────

    #[test]
    fn one_migration_per_tenant_in_flight() {
        let store = StateStore::open_in_memory().unwrap();
        let mut job = migration_job("mig-1", "tenant-1");
        store.insert_migration_job(&job).unwrap();

        let dup = migration_job("mig-2", "tenant-1");
        assert!(matches!(store.insert_migration_job(&dup), Err(StateError::Conflict(_))));

        job.status = MigrationStatus::RolledBack;
        store.put_migration_job(&job).unwrap();
        store.insert_migration_job(&dup).unwrap();
        assert_eq!(store.list_migration_jobs().unwrap().len(), 2);
    }

    #[test]
    fn migration_hold_moves_with_the_slot() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_pool(&shared_pool("pool-1", 49, 50)).unwrap();
        store.insert_migration_job(&migration_job("mig-1", "tenant-1")).unwrap();
        store.claim_migration_job("mig-1", "w", 60).unwrap().unwrap();

        assert!(store.hold_migration_slot("mig-1", "w", "pool-1").unwrap());
        let pool = store.get_pool("pool-1").unwrap().unwrap();
        assert_eq!(pool.current_instances, 50);
        assert_eq!(pool.status, PoolStatus::Full);
        let job = store.get_migration_job("mig-1").unwrap().unwrap();
        assert_eq!(job.target_hold.as_deref(), Some("pool-1"));

        // One hold per job; other drivers are locked out.
        assert!(matches!(
            store.hold_migration_slot("mig-1", "w", "pool-1"),
            Err(StateError::Conflict(_))
        ));
        assert!(matches!(
            store.release_migration_hold("mig-1", "other"),
            Err(StateError::Conflict(_))
        ));

        assert_eq!(
            store.release_migration_hold("mig-1", "w").unwrap().as_deref(),
            Some("pool-1")
        );
        assert_eq!(store.release_migration_hold("mig-1", "w").unwrap(), None);
        let pool = store.get_pool("pool-1").unwrap().unwrap();
        assert_eq!(pool.current_instances, 49);
        assert_eq!(pool.status, PoolStatus::Active);
        assert!(store.get_migration_job("mig-1").unwrap().unwrap().target_hold.is_none());
    }

    #[test]
    fn migration_hold_needs_room() {
        let store = StateStore::open_in_memory().unwrap();
        let mut full = shared_pool("pool-1", 50, 50);
        full.status = PoolStatus::Full;
        store.put_pool(&full).unwrap();
        store.insert_migration_job(&migration_job("mig-1", "tenant-1")).unwrap();
        store.claim_migration_job("mig-1", "w", 60).unwrap().unwrap();

        assert!(!store.hold_migration_slot("mig-1", "w", "pool-1").unwrap());
        assert_eq!(store.get_pool("pool-1").unwrap().unwrap().current_instances, 50);
        assert!(store.get_migration_job("mig-1").unwrap().unwrap().target_hold.is_none());
    }

    #[test]
    fn claim_next_migration_picks_oldest() {
        let store = StateStore::open_in_memory().unwrap();
        let mut newer = migration_job("mig-new", "tenant-1");
        newer.created_at = 2000;
        let mut older = migration_job("mig-old", "tenant-2");
        older.created_at = 1000;
        store.insert_migration_job(&newer).unwrap();
        store.insert_migration_job(&older).unwrap();

        let claimed = store.claim_next_migration_job("w", 60).unwrap().unwrap();
        assert_eq!(claimed.id, "mig-old");
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("fleet.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_pool(&shared_pool("pool-1", 3, 50)).unwrap();
            store.insert_allocation(&allocation("tenant-1", "pool-1")).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let pool = store.get_pool("pool-1").unwrap().unwrap();
        assert_eq!(pool.current_instances, 3);
        assert!(store.get_allocation("tenant-1").unwrap().is_some());
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_pools(&PoolFilter::default()).unwrap().is_empty());
        assert!(store.list_allocations().unwrap().is_empty());
        assert!(store.list_provisioning_jobs().unwrap().is_empty());
        assert!(store.list_migration_jobs().unwrap().is_empty());
        assert!(store.claim_next_provisioning_job("w", 60).unwrap().is_none());
        assert!(!store.delete_allocation("nope").unwrap());
    }
}
