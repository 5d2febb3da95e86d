//! Record builders shared by this crate's unit tests.

use crate::types::*;

pub fn shared_pool(id: &str, current: u32, max: u32) -> PoolRecord {
    PoolRecord {
        id: id.to_string(),
        name: format!("pg-shared-{id}"),
        host: "10.0.0.5".to_string(),
        port: 5432,
        kind: PoolKind::Shared,
        current_instances: current,
        max_instances: max,
        status: PoolStatus::Active,
        health: HealthStatus::Healthy,
        last_health_check: None,
        consecutive_failures: 0,
        owner: None,
        priority: 100,
        resources: ResourceLimits::default(),
        volume_handle: None,
        storage_path: None,
        executor_id: None,
        created_at: 1000,
        updated_at: 1000,
    }
}

pub fn dedicated_pool(id: &str, tenant: &str) -> PoolRecord {
    PoolRecord {
        kind: PoolKind::Dedicated,
        name: format!("pg-dedicated-{tenant}"),
        max_instances: 1,
        owner: Some(PoolOwner {
            customer_id: "cust-1".to_string(),
            tenant_id: tenant.to_string(),
        }),
        ..shared_pool(id, 0, 1)
    }
}

pub fn allocation(tenant: &str, pool_id: &str) -> TenantAllocation {
    TenantAllocation {
        tenant_id: tenant.to_string(),
        customer_id: "cust-1".to_string(),
        kind: PoolKind::Shared,
        pool_id: pool_id.to_string(),
        host: "10.0.0.5".to_string(),
        port: 5432,
        database_name: format!("db_{tenant}"),
        generation: 0,
        allocated_at: 1000,
    }
}

pub fn provisioning_job(id: &str, owner_tenant: Option<&str>) -> ProvisioningJob {
    ProvisioningJob {
        id: id.to_string(),
        kind: if owner_tenant.is_some() {
            PoolKind::Dedicated
        } else {
            PoolKind::Shared
        },
        max_instances: 50,
        priority: 100,
        owner: owner_tenant.map(|t| PoolOwner {
            customer_id: "cust-1".to_string(),
            tenant_id: t.to_string(),
        }),
        resources: ResourceLimits::default(),
        pool_id: format!("pool-for-{id}"),
        pool_name: format!("pg-shared-{id}"),
        phase: ProvisionPhase::AllocateStorage,
        status: JobStatus::Queued,
        attempts: 0,
        last_error: None,
        volume: None,
        server: None,
        ready_at: None,
        lease: None,
        deadline_at: u64::MAX,
        created_at: 1000,
        updated_at: 1000,
    }
}

pub fn migration_job(id: &str, tenant: &str) -> MigrationJob {
    MigrationJob {
        id: id.to_string(),
        tenant_id: tenant.to_string(),
        customer_id: "cust-1".to_string(),
        source: allocation(tenant, "pool-1"),
        target_kind: PoolKind::Dedicated,
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
        created_at: 1000,
        updated_at: 1000,
    }
}
