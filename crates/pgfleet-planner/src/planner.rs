//! Allocation planner: places a tenant on a pool.
//!
//! Fast path: pick the best allocatable pool, reserve a slot, have the
//! executor create the tenant database, persist the mapping. Slow path:
//! no pool has room, so a provisioning job is enqueued and the caller gets
//! `Pending` with a retry hint. The planner never waits on provisioning.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use pgfleet_core::config::{PlannerSettings, duration_or};
use pgfleet_core::{CredentialHandle, Credentials, Entitlement, WorkloadExecutor, epoch_secs};
use pgfleet_provision::{ProvisionQueue, ProvisionRequest};
use pgfleet_state::*;

use crate::credentials::{database_identity, generate_password};
use crate::entitlements::{CachedEntitlements, permits};
use crate::error::PlannerResult;

/// A request to place one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub tenant_id: TenantId,
    pub customer_id: String,
    pub kind: PoolKind,
}

/// Outcome of an allocation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationResult {
    Allocated {
        pool_id: PoolId,
        host: String,
        port: u16,
        database_name: String,
        credentials: Credentials,
    },
    /// No capacity right now; a provisioning job is on its way.
    Pending { retry_after_secs: u64, job_id: JobId },
    Failed { reason: String },
}

impl AllocationResult {
    fn failed(reason: impl Into<String>) -> Self {
        AllocationResult::Failed {
            reason: reason.into(),
        }
    }
}

/// Takes and gives back pool slots on behalf of one reservation.
///
/// The plain [`CapacityTracker`] only moves the counter; a migration
/// records the slot on its job in the same transaction.
pub trait SlotLedger: Send + Sync {
    /// Take one slot. `false` when the pool has no room or is not active.
    fn reserve(&self, pool_id: &str) -> StateResult<bool>;
    fn release(&self, pool_id: &str) -> StateResult<()>;
}

impl SlotLedger for CapacityTracker {
    fn reserve(&self, pool_id: &str) -> StateResult<bool> {
        CapacityTracker::reserve(self, pool_id)
    }

    fn release(&self, pool_id: &str) -> StateResult<()> {
        CapacityTracker::release(self, pool_id)
    }
}

pub struct AllocationPlanner {
    store: StateStore,
    capacity: CapacityTracker,
    queue: ProvisionQueue,
    executor: Arc<dyn WorkloadExecutor>,
    entitlements: Arc<CachedEntitlements>,
    settings: PlannerSettings,
    materialize_timeout: Duration,
}

impl AllocationPlanner {
    pub fn new(
        store: StateStore,
        queue: ProvisionQueue,
        executor: Arc<dyn WorkloadExecutor>,
        entitlements: Arc<CachedEntitlements>,
        settings: PlannerSettings,
    ) -> Self {
        Self {
            capacity: CapacityTracker::new(store.clone()),
            store,
            queue,
            executor,
            entitlements,
            materialize_timeout: duration_or(&settings.materialize_timeout, Duration::from_secs(2)),
            settings,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn capacity(&self) -> &CapacityTracker {
        &self.capacity
    }

    pub fn entitlements(&self) -> &CachedEntitlements {
        &self.entitlements
    }

    /// Place a tenant that has no allocation yet and record the mapping.
    pub async fn allocate(&self, request: &AllocationRequest) -> PlannerResult<AllocationResult> {
        if self.store.get_allocation(&request.tenant_id)?.is_some() {
            return Ok(AllocationResult::failed(format!(
                "tenant {} is already allocated",
                request.tenant_id
            )));
        }

        let result = self.reserve_slot(request).await?;
        let AllocationResult::Allocated {
            pool_id,
            host,
            port,
            database_name,
            ..
        } = &result
        else {
            return Ok(result);
        };

        let allocation = TenantAllocation {
            tenant_id: request.tenant_id.clone(),
            customer_id: request.customer_id.clone(),
            kind: request.kind,
            pool_id: pool_id.clone(),
            host: host.clone(),
            port: *port,
            database_name: database_name.clone(),
            generation: 0,
            allocated_at: epoch_secs(),
        };
        match self.store.insert_allocation(&allocation) {
            Ok(()) => {
                info!(
                    tenant_id = %request.tenant_id,
                    pool_id = %allocation.pool_id,
                    kind = %request.kind,
                    "tenant allocated"
                );
                Ok(result)
            }
            // A concurrent call for the same tenant won.
            Err(StateError::Conflict(reason)) => {
                self.capacity.release(pool_id)?;
                Ok(AllocationResult::failed(reason))
            }
            Err(e) => {
                self.capacity.release(pool_id)?;
                Err(e.into())
            }
        }
    }

    /// Reserve a slot and create the tenant database without recording
    /// a tenant mapping.
    pub async fn reserve_slot(&self, request: &AllocationRequest) -> PlannerResult<AllocationResult> {
        self.reserve_slot_with(request, &self.capacity).await
    }

    /// [`Self::reserve_slot`] with slots taken and given back through
    /// `ledger`. Used to obtain migration targets.
    pub async fn reserve_slot_with(
        &self,
        request: &AllocationRequest,
        ledger: &dyn SlotLedger,
    ) -> PlannerResult<AllocationResult> {
        if request.kind == PoolKind::Platform {
            return Ok(AllocationResult::failed(
                "platform pools are not available to tenants",
            ));
        }

        let entitlement = match self.entitlements.get(&request.customer_id).await {
            Ok(entitlement) => entitlement,
            Err(e) => {
                warn!(customer_id = %request.customer_id, error = %e, "entitlement lookup failed");
                return Ok(AllocationResult::failed(format!("entitlement lookup failed: {e}")));
            }
        };
        if !permits(&entitlement, request.kind) {
            return Ok(AllocationResult::failed(format!(
                "plan of customer {} does not include {} databases",
                request.customer_id, request.kind
            )));
        }

        let filter = match request.kind {
            PoolKind::Dedicated => CandidateFilter {
                owner_tenant: Some(request.tenant_id.clone()),
            },
            _ => CandidateFilter::default(),
        };

        match self.reserve_candidate(request.kind, &filter, ledger)? {
            Some(pool) => self.materialize(request, &pool, ledger).await,
            None => self.enqueue_pending(request, &entitlement),
        }
    }

    /// Reserve on the best candidate, reselecting after lost races.
    fn reserve_candidate(
        &self,
        kind: PoolKind,
        filter: &CandidateFilter,
        ledger: &dyn SlotLedger,
    ) -> PlannerResult<Option<PoolRecord>> {
        for attempt in 1..=self.settings.max_reserve_attempts.max(1) {
            let Some(pool) = self.store.find_candidates(kind, filter)?.into_iter().next() else {
                return Ok(None);
            };
            if ledger.reserve(&pool.id)? {
                return Ok(Some(pool));
            }
            debug!(pool_id = %pool.id, attempt, "lost reservation race, reselecting");
        }
        Ok(None)
    }

    fn enqueue_pending(
        &self,
        request: &AllocationRequest,
        entitlement: &Entitlement,
    ) -> PlannerResult<AllocationResult> {
        let provision = match request.kind {
            PoolKind::Dedicated => ProvisionRequest::dedicated(
                PoolOwner {
                    customer_id: request.customer_id.clone(),
                    tenant_id: request.tenant_id.clone(),
                },
                entitlement.resources.clone(),
            ),
            _ => ProvisionRequest::shared(self.queue.settings(), self.settings.default_pool_capacity),
        };
        let job = self.queue.enqueue(provision)?.into_job();
        info!(
            tenant_id = %request.tenant_id,
            kind = %request.kind,
            job_id = %job.id,
            "no capacity, allocation pending"
        );
        Ok(AllocationResult::Pending {
            retry_after_secs: self.settings.retry_after_secs,
            job_id: job.id,
        })
    }

    /// Create the tenant database on a reserved pool. Releases the slot
    /// if the executor fails or does not answer in time.
    async fn materialize(
        &self,
        request: &AllocationRequest,
        pool: &PoolRecord,
        ledger: &dyn SlotLedger,
    ) -> PlannerResult<AllocationResult> {
        let identity = database_identity(&request.customer_id, &request.tenant_id);
        let credentials = Credentials {
            user: identity.user.clone(),
            password: generate_password(),
        };
        let handle = CredentialHandle::new(
            format!("{}@{}", request.tenant_id, pool.id),
            credentials.clone(),
        );

        let created = tokio::time::timeout(
            self.materialize_timeout,
            self.executor
                .create_database(&pool.endpoint(), &identity, handle),
        )
        .await;
        let failure = match created {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("database creation failed: {e}")),
            Err(_) => Some(format!(
                "database creation timed out after {:?}",
                self.materialize_timeout
            )),
        };
        if let Some(reason) = failure {
            ledger.release(&pool.id)?;
            warn!(tenant_id = %request.tenant_id, pool_id = %pool.id, %reason, "allocation failed, slot released");
            return Ok(AllocationResult::Failed { reason });
        }

        Ok(AllocationResult::Allocated {
            pool_id: pool.id.clone(),
            host: pool.host.clone(),
            port: pool.port,
            database_name: identity.database_name,
            credentials,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgfleet_testing::*;

    struct Harness {
        store: StateStore,
        executor: Arc<FakeExecutor>,
        entitlements: Arc<StaticEntitlements>,
        planner: AllocationPlanner,
    }

    fn harness() -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let executor = Arc::new(FakeExecutor::new());
        let entitlements = Arc::new(
            StaticEntitlements::new()
                .with(entitlement("cust-shared", PoolKind::Shared))
                .with(entitlement("cust-ded", PoolKind::Dedicated)),
        );
        let config = fast_config();
        let mut planner_settings = config.planner.clone();
        planner_settings.materialize_timeout = "100ms".to_string();
        let planner = AllocationPlanner::new(
            store.clone(),
            ProvisionQueue::new(store.clone(), config.provision.clone()),
            executor.clone(),
            Arc::new(CachedEntitlements::new(
                entitlements.clone(),
                Duration::from_secs(300),
            )),
            planner_settings,
        );
        Harness {
            store,
            executor,
            entitlements,
            planner,
        }
    }

    fn shared_request(tenant: &str) -> AllocationRequest {
        AllocationRequest {
            tenant_id: tenant.to_string(),
            customer_id: "cust-shared".to_string(),
            kind: PoolKind::Shared,
        }
    }

    fn dedicated_request(tenant: &str) -> AllocationRequest {
        AllocationRequest {
            tenant_id: tenant.to_string(),
            customer_id: "cust-ded".to_string(),
            kind: PoolKind::Dedicated,
        }
    }

    #[tokio::test]
    async fn allocates_on_least_loaded_pool() {
        let h = harness();
        h.store.put_pool(&shared_pool("busy", 30, 50)).unwrap();
        h.store.put_pool(&shared_pool("idle", 2, 50)).unwrap();

        let result = h.planner.allocate(&shared_request("t1")).await.unwrap();
        let AllocationResult::Allocated {
            pool_id,
            host,
            database_name,
            credentials,
            ..
        } = result
        else {
            panic!("expected allocation, got {result:?}");
        };

        assert_eq!(pool_id, "idle");
        assert_eq!(host, "idle.pg.internal");
        let identity = database_identity("cust-shared", "t1");
        assert_eq!(database_name, identity.database_name);
        assert_eq!(credentials.user, identity.user);

        assert_eq!(h.store.get_pool("idle").unwrap().unwrap().current_instances, 3);
        let mapping = h.store.get_allocation("t1").unwrap().unwrap();
        assert_eq!(mapping.pool_id, "idle");
        assert_eq!(mapping.generation, 0);

        // The executor received the same credentials through the handle.
        let created = h.executor.databases();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].credentials, credentials);
    }

    #[tokio::test]
    async fn priority_beats_load() {
        let h = harness();
        let mut preferred = shared_pool("preferred", 40, 50);
        preferred.priority = 1;
        h.store.put_pool(&preferred).unwrap();
        h.store.put_pool(&shared_pool("empty", 0, 50)).unwrap();

        let result = h.planner.allocate(&shared_request("t1")).await.unwrap();
        assert!(matches!(result, AllocationResult::Allocated { pool_id, .. } if pool_id == "preferred"));
    }

    #[tokio::test]
    async fn last_slot_makes_pool_full_then_pending() {
        let h = harness();
        h.store.put_pool(&shared_pool("p1", 49, 50)).unwrap();

        let first = h.planner.allocate(&shared_request("t1")).await.unwrap();
        assert!(matches!(first, AllocationResult::Allocated { .. }));
        let pool = h.store.get_pool("p1").unwrap().unwrap();
        assert_eq!(pool.status, PoolStatus::Full);

        let second = h.planner.allocate(&shared_request("t2")).await.unwrap();
        assert!(matches!(
            second,
            AllocationResult::Pending {
                retry_after_secs: 30,
                ..
            }
        ));
        assert!(h.store.get_allocation("t2").unwrap().is_none());
    }

    #[tokio::test]
    async fn full_pool_is_skipped() {
        let h = harness();
        let mut full = shared_pool("full", 50, 50);
        full.priority = 1;
        h.store.put_pool(&full).unwrap();
        h.store.put_pool(&shared_pool("open", 10, 50)).unwrap();

        let result = h.planner.allocate(&shared_request("t1")).await.unwrap();
        assert!(matches!(result, AllocationResult::Allocated { pool_id, .. } if pool_id == "open"));
        assert_eq!(h.store.get_pool("full").unwrap().unwrap().current_instances, 50);
    }

    #[tokio::test]
    async fn empty_registry_enqueues_one_job_for_concurrent_callers() {
        let h = harness();

        let (req1, req2) = (shared_request("t1"), shared_request("t2"));
        let (a, b) = tokio::join!(h.planner.allocate(&req1), h.planner.allocate(&req2),);
        let job_a = match a.unwrap() {
            AllocationResult::Pending { job_id, .. } => job_id,
            other => panic!("expected pending, got {other:?}"),
        };
        let job_b = match b.unwrap() {
            AllocationResult::Pending { job_id, .. } => job_id,
            other => panic!("expected pending, got {other:?}"),
        };

        assert_eq!(job_a, job_b);
        let jobs = h.store.list_provisioning_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, PoolKind::Shared);
        assert_eq!(jobs[0].max_instances, 50);
    }

    #[tokio::test]
    async fn second_allocation_for_tenant_fails() {
        let h = harness();
        h.store.put_pool(&shared_pool("p1", 0, 50)).unwrap();

        h.planner.allocate(&shared_request("t1")).await.unwrap();
        let again = h.planner.allocate(&shared_request("t1")).await.unwrap();
        assert!(matches!(again, AllocationResult::Failed { .. }));
        assert_eq!(h.store.get_pool("p1").unwrap().unwrap().current_instances, 1);
    }

    #[tokio::test]
    async fn plan_must_cover_requested_kind() {
        let h = harness();
        let mut request = dedicated_request("t1");
        request.customer_id = "cust-shared".to_string();

        let result = h.planner.allocate(&request).await.unwrap();
        assert!(matches!(result, AllocationResult::Failed { reason } if reason.contains("does not include")));

        let mut unknown = shared_request("t2");
        unknown.customer_id = "nobody".to_string();
        assert!(matches!(
            h.planner.allocate(&unknown).await.unwrap(),
            AllocationResult::Failed { .. }
        ));
        assert!(h.store.list_provisioning_jobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn entitlements_are_cached() {
        let h = harness();
        h.store.put_pool(&shared_pool("p1", 0, 50)).unwrap();
        h.planner.allocate(&shared_request("t1")).await.unwrap();
        h.planner.allocate(&shared_request("t2")).await.unwrap();
        assert_eq!(h.entitlements.lookups(), 1);
    }

    #[tokio::test]
    async fn platform_kind_is_never_allocated() {
        let h = harness();
        h.store
            .put_pool(&active_pool("plat", PoolKind::Platform, 0, 50))
            .unwrap();
        let mut request = shared_request("t1");
        request.kind = PoolKind::Platform;

        let result = h.planner.allocate(&request).await.unwrap();
        assert!(matches!(result, AllocationResult::Failed { .. }));
        assert_eq!(h.store.get_pool("plat").unwrap().unwrap().current_instances, 0);
    }

    #[tokio::test]
    async fn dedicated_uses_only_the_tenants_own_pool() {
        let h = harness();
        h.store.put_pool(&shared_pool("shared", 0, 50)).unwrap();
        h.store
            .put_pool(&dedicated_pool("other", "cust-ded", "t-other"))
            .unwrap();

        let pending = h.planner.allocate(&dedicated_request("t1")).await.unwrap();
        let AllocationResult::Pending { job_id, .. } = pending else {
            panic!("expected pending, got {pending:?}");
        };
        let job = h.store.get_provisioning_job(&job_id).unwrap().unwrap();
        assert_eq!(job.kind, PoolKind::Dedicated);
        assert_eq!(job.max_instances, 1);
        assert_eq!(job.owner.unwrap().tenant_id, "t1");

        // Once the tenant's own pool exists it is used.
        h.store
            .put_pool(&dedicated_pool("mine", "cust-ded", "t1"))
            .unwrap();
        let result = h.planner.allocate(&dedicated_request("t1")).await.unwrap();
        assert!(matches!(result, AllocationResult::Allocated { pool_id, .. } if pool_id == "mine"));
        let mine = h.store.get_pool("mine").unwrap().unwrap();
        assert_eq!(mine.status, PoolStatus::Full);
        assert_eq!(h.store.get_pool("shared").unwrap().unwrap().current_instances, 0);
    }

    #[tokio::test]
    async fn executor_failure_releases_slot() {
        let h = harness();
        h.store.put_pool(&shared_pool("p1", 49, 50)).unwrap();
        h.executor.set_fail_create_database(true);

        let result = h.planner.allocate(&shared_request("t1")).await.unwrap();
        assert!(matches!(result, AllocationResult::Failed { .. }));

        let pool = h.store.get_pool("p1").unwrap().unwrap();
        assert_eq!(pool.current_instances, 49);
        assert_eq!(pool.status, PoolStatus::Active);
        assert!(h.store.get_allocation("t1").unwrap().is_none());
    }

    #[tokio::test]
    async fn slow_executor_times_out_and_releases() {
        let h = harness();
        h.store.put_pool(&shared_pool("p1", 0, 50)).unwrap();
        h.executor.set_create_delay(Some(Duration::from_millis(500)));

        let result = h.planner.allocate(&shared_request("t1")).await.unwrap();
        assert!(matches!(result, AllocationResult::Failed { reason } if reason.contains("timed out")));
        assert_eq!(h.store.get_pool("p1").unwrap().unwrap().current_instances, 0);
    }

    #[tokio::test]
    async fn reserve_slot_does_not_record_mapping() {
        let h = harness();
        h.store.put_pool(&shared_pool("p1", 0, 50)).unwrap();

        let result = h.planner.reserve_slot(&shared_request("t1")).await.unwrap();
        assert!(matches!(result, AllocationResult::Allocated { .. }));
        assert_eq!(h.store.get_pool("p1").unwrap().unwrap().current_instances, 1);
        assert!(h.store.get_allocation("t1").unwrap().is_none());
    }

    /// Delegates to a capacity tracker and remembers every call.
    struct RecordingLedger {
        capacity: CapacityTracker,
        calls: std::sync::Mutex<Vec<String>>,
    }

    impl SlotLedger for RecordingLedger {
        fn reserve(&self, pool_id: &str) -> StateResult<bool> {
            self.calls.lock().unwrap().push(format!("reserve {pool_id}"));
            self.capacity.reserve(pool_id)
        }

        fn release(&self, pool_id: &str) -> StateResult<()> {
            self.calls.lock().unwrap().push(format!("release {pool_id}"));
            self.capacity.release(pool_id)
        }
    }

    #[tokio::test]
    async fn slots_go_through_the_given_ledger() {
        let h = harness();
        h.store.put_pool(&shared_pool("p1", 0, 50)).unwrap();
        let ledger = RecordingLedger {
            capacity: CapacityTracker::new(h.store.clone()),
            calls: Default::default(),
        };

        h.executor.set_fail_create_database(true);
        let failed = h.planner.reserve_slot_with(&shared_request("t1"), &ledger).await.unwrap();
        assert!(matches!(failed, AllocationResult::Failed { .. }));

        h.executor.set_fail_create_database(false);
        let allocated = h.planner.reserve_slot_with(&shared_request("t1"), &ledger).await.unwrap();
        assert!(matches!(allocated, AllocationResult::Allocated { .. }));

        assert_eq!(
            *ledger.calls.lock().unwrap(),
            vec!["reserve p1", "release p1", "reserve p1"]
        );
        assert_eq!(h.store.get_pool("p1").unwrap().unwrap().current_instances, 1);
    }

    #[tokio::test]
    async fn unhealthy_pools_are_not_candidates() {
        let h = harness();
        let mut sick = shared_pool("sick", 0, 50);
        sick.health = HealthStatus::Unhealthy;
        sick.status = PoolStatus::Degraded;
        h.store.put_pool(&sick).unwrap();

        let result = h.planner.allocate(&shared_request("t1")).await.unwrap();
        assert!(matches!(result, AllocationResult::Pending { .. }));
    }
}
