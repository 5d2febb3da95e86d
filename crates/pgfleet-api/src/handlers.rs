//! REST API handlers.
//!
//! Each handler calls one operation of the fleet core and returns JSON in
//! the `{success, data, error}` envelope.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::warn;

use pgfleet_health::HealthError;
use pgfleet_migrate::MigrationError;
use pgfleet_planner::{AllocationRequest, AllocationResult, permits};
use pgfleet_state::*;

use crate::ApiState;
use crate::stats::PoolStats;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    /// An unsuccessful outcome that still carries a body.
    fn refused(data: T, reason: &str) -> Json<Self> {
        Json(Self {
            success: false,
            data: Some(data),
            error: Some(reason.to_string()),
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn internal(e: impl std::fmt::Display) -> axum::response::Response {
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
}

// ── Allocations ────────────────────────────────────────────────

/// Outcome of `POST /api/v1/allocations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AllocationResponse {
    Allocated {
        pool_id: String,
        host: String,
        port: u16,
        database_name: String,
        db_user: String,
        db_password: String,
    },
    Pending {
        retry_after_seconds: u64,
        job_id: String,
    },
    Failed {
        reason: String,
    },
}

impl From<AllocationResult> for AllocationResponse {
    fn from(result: AllocationResult) -> Self {
        match result {
            AllocationResult::Allocated {
                pool_id,
                host,
                port,
                database_name,
                credentials,
            } => AllocationResponse::Allocated {
                pool_id,
                host,
                port,
                database_name,
                db_user: credentials.user,
                db_password: credentials.password,
            },
            AllocationResult::Pending {
                retry_after_secs,
                job_id,
            } => AllocationResponse::Pending {
                retry_after_seconds: retry_after_secs,
                job_id,
            },
            AllocationResult::Failed { reason } => AllocationResponse::Failed { reason },
        }
    }
}

/// POST /api/v1/allocations
pub async fn allocate(
    State(state): State<ApiState>,
    Json(req): Json<AllocationRequest>,
) -> impl IntoResponse {
    let result = match state.planner.allocate(&req).await {
        Ok(result) => result,
        Err(e) => return internal(e),
    };
    match AllocationResponse::from(result) {
        body @ AllocationResponse::Allocated { .. } => {
            (StatusCode::CREATED, ApiResponse::ok(body)).into_response()
        }
        body @ AllocationResponse::Pending { .. } => {
            (StatusCode::ACCEPTED, ApiResponse::ok(body)).into_response()
        }
        AllocationResponse::Failed { reason } => (
            StatusCode::CONFLICT,
            ApiResponse::refused(
                AllocationResponse::Failed {
                    reason: reason.clone(),
                },
                &reason,
            ),
        )
            .into_response(),
    }
}

// ── Dedicated pools ────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct DedicatedRequest {
    pub tenant_id: String,
    pub customer_id: String,
}

/// Outcome of `POST /api/v1/dedicated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DedicatedResponse {
    Provisioned { pool_id: String, host: String },
    Failed { reason: String },
}

fn dedicated_failed(reason: String, status: StatusCode) -> axum::response::Response {
    (
        status,
        ApiResponse::refused(
            DedicatedResponse::Failed {
                reason: reason.clone(),
            },
            &reason,
        ),
    )
        .into_response()
}

/// POST /api/v1/dedicated
///
/// Blocks until the pool is active or provisioning gives up.
pub async fn provision_dedicated(
    State(state): State<ApiState>,
    Json(req): Json<DedicatedRequest>,
) -> impl IntoResponse {
    let entitlement = match state.planner.entitlements().get(&req.customer_id).await {
        Ok(entitlement) => entitlement,
        Err(e) => {
            return dedicated_failed(
                format!("entitlement lookup failed: {e}"),
                StatusCode::BAD_GATEWAY,
            );
        }
    };
    if !permits(&entitlement, PoolKind::Dedicated) {
        return dedicated_failed(
            format!(
                "plan of customer {} does not include dedicated databases",
                req.customer_id
            ),
            StatusCode::FORBIDDEN,
        );
    }

    let owner = PoolOwner {
        customer_id: req.customer_id,
        tenant_id: req.tenant_id,
    };
    match state
        .orchestrator
        .provision_dedicated(owner, entitlement.resources)
        .await
    {
        Ok(pool) => ApiResponse::ok(DedicatedResponse::Provisioned {
            pool_id: pool.id,
            host: pool.host,
        })
        .into_response(),
        Err(e) => {
            warn!(error = %e, "dedicated provisioning failed");
            dedicated_failed(e.to_string(), StatusCode::BAD_GATEWAY)
        }
    }
}

// ── Pools ──────────────────────────────────────────────────────

/// Query parameters for the pool listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolQuery {
    pub status: Option<PoolStatus>,
    pub kind: Option<PoolKind>,
}

#[derive(Serialize)]
struct PoolListing {
    pools: Vec<PoolRecord>,
    stats: PoolStats,
}

/// GET /api/v1/pools
pub async fn list_pools(
    State(state): State<ApiState>,
    Query(query): Query<PoolQuery>,
) -> impl IntoResponse {
    let filter = PoolFilter {
        status: query.status,
        kind: query.kind,
    };
    match state.store.list_pools(&filter) {
        Ok(pools) => {
            let stats = PoolStats::from_pools(&pools);
            ApiResponse::ok(PoolListing { pools, stats }).into_response()
        }
        Err(e) => internal(e),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePoolRequest {
    pub max_instances: u32,
}

/// POST /api/v1/pools
pub async fn create_pool(
    State(state): State<ApiState>,
    Json(req): Json<CreatePoolRequest>,
) -> impl IntoResponse {
    if req.max_instances == 0 {
        return error_response("max_instances must be positive", StatusCode::BAD_REQUEST)
            .into_response();
    }
    match state.orchestrator.enqueue_pool(req.max_instances) {
        Ok(job) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(serde_json::json!({ "job_id": job.id })),
        )
            .into_response(),
        Err(e) => internal(e),
    }
}

/// POST /api/v1/pools/{id}/health-check
pub async fn check_pool(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.monitor.check_pool(&id).await {
        Ok(pool) => ApiResponse::ok(serde_json::json!({
            "pool_id": pool.id,
            "health_status": pool.health,
        }))
        .into_response(),
        Err(HealthError::PoolNotFound(_)) => {
            error_response("pool not found", StatusCode::NOT_FOUND).into_response()
        }
        Err(e @ HealthError::NotServing { .. }) => {
            error_response(&e.to_string(), StatusCode::CONFLICT).into_response()
        }
        Err(e) => internal(e),
    }
}

// ── Jobs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationRequest {
    pub tenant_id: String,
    pub target_kind: PoolKind,
}

/// POST /api/v1/migrations
///
/// Creates the job; a migration worker runs it.
pub async fn request_migration(
    State(state): State<ApiState>,
    Json(req): Json<MigrationRequest>,
) -> impl IntoResponse {
    match state.migrations.request(&req.tenant_id, req.target_kind) {
        Ok(job) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(serde_json::json!({ "job_id": job.id })),
        )
            .into_response(),
        Err(MigrationError::Validation(reason)) => {
            error_response(&reason, StatusCode::UNPROCESSABLE_ENTITY).into_response()
        }
        Err(e) => internal(e),
    }
}

/// GET /api/v1/migrations/{id}
pub async fn get_migration(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_migration_job(&id) {
        Ok(Some(job)) => ApiResponse::ok(job).into_response(),
        Ok(None) => error_response("migration job not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /api/v1/provisioning/{id}
pub async fn get_provisioning_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_provisioning_job(&id) {
        Ok(Some(job)) => ApiResponse::ok(job).into_response(),
        Ok(None) => {
            error_response("provisioning job not found", StatusCode::NOT_FOUND).into_response()
        }
        Err(e) => internal(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::to_bytes;
    use pgfleet_health::HealthMonitor;
    use pgfleet_migrate::MigrationCoordinator;
    use pgfleet_planner::{AllocationPlanner, CachedEntitlements};
    use pgfleet_provision::{Orchestrator, ProvisionQueue};
    use pgfleet_testing::*;

    fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        let config = fast_config();
        let executor = Arc::new(FakeExecutor::new());
        let entitlements = Arc::new(
            StaticEntitlements::new()
                .with(entitlement("cust-shared", PoolKind::Shared))
                .with(entitlement("cust-ded", PoolKind::Dedicated)),
        );
        let planner = Arc::new(AllocationPlanner::new(
            store.clone(),
            ProvisionQueue::new(store.clone(), config.provision.clone()),
            executor.clone(),
            Arc::new(CachedEntitlements::new(entitlements, Duration::from_secs(300))),
            config.planner.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            config.provision.clone(),
            Arc::new(FakeVolumes::new()),
            executor,
        ));
        let monitor = Arc::new(HealthMonitor::new(
            store.clone(),
            Arc::new(FakeProber::new()),
            &config.health,
        ));
        let migrations = Arc::new(MigrationCoordinator::new(
            store.clone(),
            planner.clone(),
            orchestrator.clone(),
            Arc::new(FakeWorkload::new()),
            Arc::new(FakeMover::new()),
            config.migration.clone(),
        ));
        ApiState {
            store,
            planner,
            orchestrator,
            monitor,
            migrations,
        }
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(tenant: &str, customer: &str, kind: PoolKind) -> AllocationRequest {
        AllocationRequest {
            tenant_id: tenant.to_string(),
            customer_id: customer.to_string(),
            kind,
        }
    }

    #[tokio::test]
    async fn allocate_returns_credentials() {
        let state = test_state();
        state.store.put_pool(&shared_pool("p1", 0, 50)).unwrap();

        let resp = allocate(State(state), Json(request("t1", "cust-shared", PoolKind::Shared)))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "allocated");
        assert_eq!(body["data"]["pool_id"], "p1");
        assert_eq!(body["data"]["port"], 5432);
        assert_eq!(body["data"]["db_password"].as_str().unwrap().len(), 48);
    }

    #[tokio::test]
    async fn allocate_without_capacity_is_pending() {
        let state = test_state();
        let resp = allocate(State(state), Json(request("t1", "cust-shared", PoolKind::Shared)))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let body = body_json(resp).await;
        assert_eq!(body["data"]["status"], "pending");
        assert_eq!(body["data"]["retry_after_seconds"], 30);
    }

    #[tokio::test]
    async fn allocate_outside_plan_fails() {
        let state = test_state();
        let resp = allocate(State(state), Json(request("t1", "cust-shared", PoolKind::Dedicated)))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["data"]["status"], "failed");
        assert!(body["error"].as_str().unwrap().contains("does not include"));
    }

    #[tokio::test]
    async fn dedicated_provisioning_blocks_until_active() {
        let state = test_state();
        let req = DedicatedRequest {
            tenant_id: "t1".to_string(),
            customer_id: "cust-ded".to_string(),
        };
        let resp = provision_dedicated(State(state.clone()), Json(req))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["data"]["status"], "provisioned");
        let pool_id = body["data"]["pool_id"].as_str().unwrap();
        let pool = state.store.get_pool(pool_id).unwrap().unwrap();
        assert_eq!(pool.status, PoolStatus::Active);
        assert_eq!(pool.kind, PoolKind::Dedicated);
    }

    #[tokio::test]
    async fn dedicated_requires_plan() {
        let state = test_state();
        let req = DedicatedRequest {
            tenant_id: "t1".to_string(),
            customer_id: "cust-shared".to_string(),
        };
        let resp = provision_dedicated(State(state.clone()), Json(req))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(state.store.list_provisioning_jobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_pools_filters_and_reports_stats() {
        let state = test_state();
        state.store.put_pool(&shared_pool("a", 50, 50)).unwrap();
        state.store.put_pool(&shared_pool("b", 10, 50)).unwrap();

        let query = PoolQuery {
            status: Some(PoolStatus::Full),
            kind: None,
        };
        let resp = list_pools(State(state.clone()), Query(query))
            .await
            .into_response();
        let body = body_json(resp).await;
        assert_eq!(body["data"]["pools"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"]["stats"]["total_used"], 50);

        let resp = list_pools(State(state), Query(PoolQuery::default()))
            .await
            .into_response();
        let body = body_json(resp).await;
        assert_eq!(body["data"]["stats"]["total_capacity"], 100);
        assert_eq!(body["data"]["stats"]["utilization_percent"], 60.0);
    }

    #[tokio::test]
    async fn create_pool_enqueues_job() {
        let state = test_state();
        let resp = create_pool(State(state.clone()), Json(CreatePoolRequest { max_instances: 20 }))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let body = body_json(resp).await;
        let job_id = body["data"]["job_id"].as_str().unwrap().to_string();
        let resp = get_provisioning_job(State(state), Path(job_id))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["max_instances"], 20);
        assert_eq!(body["data"]["kind"], "shared");
    }

    #[tokio::test]
    async fn create_pool_rejects_zero_capacity() {
        let state = test_state();
        let resp = create_pool(State(state), Json(CreatePoolRequest { max_instances: 0 }))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_check_reports_status() {
        let state = test_state();
        state.store.put_pool(&shared_pool("p1", 0, 50)).unwrap();

        let resp = check_pool(State(state.clone()), Path("p1".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["health_status"], "healthy");

        let resp = check_pool(State(state), Path("nope".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn same_kind_migration_is_unprocessable() {
        let state = test_state();
        let pool = shared_pool("p1", 1, 50);
        state.store.put_pool(&pool).unwrap();
        state
            .store
            .insert_allocation(&allocation("t1", "cust-shared", &pool))
            .unwrap();

        let req = MigrationRequest {
            tenant_id: "t1".to_string(),
            target_kind: PoolKind::Shared,
        };
        let resp = request_migration(State(state.clone()), Json(req))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(state.store.list_migration_jobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn migration_request_returns_job() {
        let state = test_state();
        let pool = shared_pool("p1", 1, 50);
        state.store.put_pool(&pool).unwrap();
        state
            .store
            .insert_allocation(&allocation("t1", "cust-ded", &pool))
            .unwrap();

        let req = MigrationRequest {
            tenant_id: "t1".to_string(),
            target_kind: PoolKind::Dedicated,
        };
        let resp = request_migration(State(state.clone()), Json(req))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let body = body_json(resp).await;
        let job_id = body["data"]["job_id"].as_str().unwrap().to_string();
        let resp = get_migration(State(state), Path(job_id)).await.into_response();
        let body = body_json(resp).await;
        assert_eq!(body["data"]["status"], "running");
        assert_eq!(body["data"]["phase"], "preparing");
    }

    #[tokio::test]
    async fn unknown_jobs_are_not_found() {
        let state = test_state();
        let resp = get_migration(State(state.clone()), Path("nope".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = get_provisioning_job(State(state), Path("nope".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
