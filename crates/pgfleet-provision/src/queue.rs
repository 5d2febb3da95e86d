//! Durable, deduplicated provisioning queue.

use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use pgfleet_core::config::{ProvisionSettings, duration_or};
use pgfleet_core::{PoolKind, ResourceLimits, epoch_secs};
use pgfleet_state::*;

use crate::error::ProvisionResult;

/// What to provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub kind: PoolKind,
    pub max_instances: u32,
    pub owner: Option<PoolOwner>,
    pub resources: ResourceLimits,
    pub priority: u32,
}

impl ProvisionRequest {
    /// A shared pool with the configured shared resource profile.
    pub fn shared(settings: &ProvisionSettings, max_instances: u32) -> Self {
        Self {
            kind: PoolKind::Shared,
            max_instances,
            owner: None,
            resources: settings.shared_resources.clone(),
            priority: settings.pool_priority,
        }
    }

    /// A single-tenant pool owned by `owner`.
    pub fn dedicated(owner: PoolOwner, resources: ResourceLimits) -> Self {
        Self {
            kind: PoolKind::Dedicated,
            max_instances: 1,
            owner: Some(owner),
            resources,
            priority: 0,
        }
    }
}

/// Creates provisioning jobs in the state store.
#[derive(Clone)]
pub struct ProvisionQueue {
    store: StateStore,
    settings: ProvisionSettings,
}

impl ProvisionQueue {
    pub fn new(store: StateStore, settings: ProvisionSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &ProvisionSettings {
        &self.settings
    }

    /// Enqueue a job unless an equivalent one is already in flight.
    pub fn enqueue(&self, request: ProvisionRequest) -> ProvisionResult<Enqueued<ProvisioningJob>> {
        let now = epoch_secs();
        let deadline = duration_or(&self.settings.job_deadline, Duration::from_secs(20 * 60));
        let pool_id = Uuid::new_v4().to_string();
        let short = &pool_id[..8];
        let pool_name = match &request.owner {
            Some(owner) => format!("pg-dedicated-{}-{short}", owner.tenant_id),
            None => format!("pg-{}-{short}", request.kind),
        };

        let job = ProvisioningJob {
            id: Uuid::new_v4().to_string(),
            kind: request.kind,
            max_instances: request.max_instances,
            priority: request.priority,
            owner: request.owner,
            resources: request.resources,
            pool_id,
            pool_name,
            phase: ProvisionPhase::AllocateStorage,
            status: JobStatus::Queued,
            attempts: 0,
            last_error: None,
            volume: None,
            server: None,
            ready_at: None,
            lease: None,
            deadline_at: now + deadline.as_secs(),
            created_at: now,
            updated_at: now,
        };

        let enqueued = self.store.enqueue_provisioning(job)?;
        if let Enqueued::Created(job) = &enqueued {
            info!(
                job_id = %job.id,
                kind = %job.kind,
                pool_name = %job.pool_name,
                max_instances = job.max_instances,
                "provisioning job enqueued"
            );
        }
        Ok(enqueued)
    }
}
