//! pgfleet-api: REST API for the PostgreSQL fleet.
//!
//! Thin axum layer over the planner, orchestrator, health monitor, and
//! migration coordinator. Handlers hold no business logic.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/allocations` | Place a tenant |
//! | POST | `/api/v1/dedicated` | Provision a dedicated pool and wait for it |
//! | GET | `/api/v1/pools` | List pools with capacity statistics |
//! | POST | `/api/v1/pools` | Enqueue a new shared pool |
//! | POST | `/api/v1/pools/{id}/health-check` | Probe one pool now |
//! | POST | `/api/v1/migrations` | Request a migration |
//! | GET | `/api/v1/migrations/{id}` | Migration job status |
//! | GET | `/api/v1/provisioning/{id}` | Provisioning job status |

pub mod handlers;
pub mod stats;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use pgfleet_health::HealthMonitor;
use pgfleet_migrate::MigrationCoordinator;
use pgfleet_planner::AllocationPlanner;
use pgfleet_provision::Orchestrator;
use pgfleet_state::StateStore;

pub use stats::PoolStats;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub planner: Arc<AllocationPlanner>,
    pub orchestrator: Arc<Orchestrator>,
    pub monitor: Arc<HealthMonitor>,
    pub migrations: Arc<MigrationCoordinator>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/allocations", post(handlers::allocate))
        .route("/dedicated", post(handlers::provision_dedicated))
        .route("/pools", get(handlers::list_pools).post(handlers::create_pool))
        .route("/pools/{id}/health-check", post(handlers::check_pool))
        .route("/migrations", post(handlers::request_migration))
        .route("/migrations/{id}", get(handlers::get_migration))
        .route("/provisioning/{id}", get(handlers::get_provisioning_job))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
