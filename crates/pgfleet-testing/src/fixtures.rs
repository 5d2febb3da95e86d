//! Record and configuration builders.

use pgfleet_core::{Entitlement, FleetConfig, PoolKind, ResourceLimits};
use pgfleet_state::{HealthStatus, PoolOwner, PoolRecord, PoolStatus, TenantAllocation};

/// An active, healthy pool ready to take tenants.
pub fn active_pool(id: &str, kind: PoolKind, current: u32, max: u32) -> PoolRecord {
    PoolRecord {
        id: id.to_string(),
        name: format!("pg-{kind}-{id}"),
        host: format!("{id}.pg.internal"),
        port: 5432,
        kind,
        current_instances: current,
        max_instances: max,
        status: if current < max {
            PoolStatus::Active
        } else {
            PoolStatus::Full
        },
        health: HealthStatus::Healthy,
        last_health_check: None,
        consecutive_failures: 0,
        owner: None,
        priority: 100,
        resources: ResourceLimits::default(),
        volume_handle: Some(format!("vol-{id}")),
        storage_path: Some(format!("/mnt/pg/{id}")),
        executor_id: Some(format!("exec-{id}")),
        created_at: 1000,
        updated_at: 1000,
    }
}

pub fn shared_pool(id: &str, current: u32, max: u32) -> PoolRecord {
    active_pool(id, PoolKind::Shared, current, max)
}

/// An empty dedicated pool owned by one tenant.
pub fn dedicated_pool(id: &str, customer_id: &str, tenant_id: &str) -> PoolRecord {
    PoolRecord {
        owner: Some(PoolOwner {
            customer_id: customer_id.to_string(),
            tenant_id: tenant_id.to_string(),
        }),
        ..active_pool(id, PoolKind::Dedicated, 0, 1)
    }
}

pub fn entitlement(customer_id: &str, db_kind: PoolKind) -> Entitlement {
    Entitlement {
        customer_id: customer_id.to_string(),
        db_kind,
        resources: ResourceLimits::default(),
        version: "v1".to_string(),
    }
}

/// Configuration with millisecond-scale intervals so loops finish fast.
pub fn fast_config() -> FleetConfig {
    let mut config = FleetConfig::default();
    config.planner.materialize_timeout = "500ms".to_string();
    config.provision.ready_poll_interval = "5ms".to_string();
    config.provision.ready_timeout = "200ms".to_string();
    config.provision.backoff_base = "5ms".to_string();
    config.provision.backoff_max = "20ms".to_string();
    config.provision.worker_interval = "10ms".to_string();
    config.health.interval = "10ms".to_string();
    config.health.probe_timeout = "100ms".to_string();
    config.migration.target_timeout = "2s".to_string();
    config.migration.phase_timeout = "500ms".to_string();
    config.migration.worker_interval = "10ms".to_string();
    config
}

/// A tenant mapping onto `pool`, at generation 0.
pub fn allocation(tenant_id: &str, customer_id: &str, pool: &PoolRecord) -> TenantAllocation {
    TenantAllocation {
        tenant_id: tenant_id.to_string(),
        customer_id: customer_id.to_string(),
        kind: pool.kind,
        pool_id: pool.id.clone(),
        host: pool.host.clone(),
        port: pool.port,
        database_name: format!("db{tenant_id}"),
        generation: 0,
        allocated_at: 1000,
    }
}
