//! Interfaces of the external systems the fleet control plane drives.
//!
//! None of these are implemented here. The daemon plugs in HTTP clients;
//! tests plug in in-memory doubles.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::{CredentialHandle, DatabaseIdentity};
use crate::types::{Endpoint, PoolKind, ResourceLimits};

/// Errors reported by a collaborator.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("{service} unavailable: {reason}")]
    Unavailable {
        service: &'static str,
        reason: String,
    },

    #[error("{service} rejected the request: {reason}")]
    Rejected {
        service: &'static str,
        reason: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("credential handle already consumed: {0}")]
    CredentialConsumed(String),
}

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

// ── Volume provisioner ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    /// Stable name; re-requesting the same name must not create a second volume.
    pub name: String,
    pub size_gb: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeHandle {
    pub id: String,
    pub mount_path: String,
}

/// Creates persistent volumes for new PostgreSQL servers.
#[async_trait]
pub trait VolumeProvisioner: Send + Sync {
    /// Look up a volume previously created under `name`.
    async fn find_volume(&self, name: &str) -> CollaboratorResult<Option<VolumeHandle>>;

    async fn allocate_volume(&self, request: &VolumeRequest) -> CollaboratorResult<VolumeHandle>;
}

// ── Workload executor ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Stable server name; also the lookup key for `find_server`.
    pub name: String,
    pub kind: PoolKind,
    pub volume_id: String,
    pub mount_path: String,
    pub resources: ResourceLimits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHandle {
    /// Executor-assigned identifier (container/service id).
    pub executor_id: String,
    pub host: String,
    pub port: u16,
}

/// Starts database server processes and materializes tenant databases.
#[async_trait]
pub trait WorkloadExecutor: Send + Sync {
    async fn find_server(&self, name: &str) -> CollaboratorResult<Option<ServerHandle>>;

    async fn start_server(&self, spec: &ServerSpec) -> CollaboratorResult<ServerHandle>;

    /// Readiness probe of a started server.
    async fn is_ready(&self, executor_id: &str) -> CollaboratorResult<bool>;

    /// Create the tenant database and login role on `server`.
    ///
    /// The executor takes the password from `credentials`; the handle
    /// cannot be read a second time.
    async fn create_database(
        &self,
        server: &Endpoint,
        identity: &DatabaseIdentity,
        credentials: CredentialHandle,
    ) -> CollaboratorResult<()>;
}

// ── Tenant workload ───────────────────────────────────────────────

/// New connection details handed to a tenant workload at cutover.
#[derive(Debug, Clone)]
pub struct Repoint {
    pub endpoint: Endpoint,
    pub database_name: String,
    pub credentials: CredentialHandle,
}

/// Controls write traffic of a tenant's running application.
#[async_trait]
pub trait TenantWorkload: Send + Sync {
    async fn pause_writes(&self, tenant_id: &str) -> CollaboratorResult<()>;

    /// Resume writes. `None` resumes against the current database;
    /// `Some` repoints the workload first.
    async fn resume_writes(&self, tenant_id: &str, repoint: Option<Repoint>)
    -> CollaboratorResult<()>;
}

// ── Data mover ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseLocation {
    pub host: String,
    pub port: u16,
    pub database_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub id: String,
    pub size_bytes: u64,
}

/// Structure and row counts observed on both sides of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub source_tables: u32,
    pub target_tables: u32,
    pub source_rows: u64,
    pub target_rows: u64,
}

impl VerifyReport {
    pub fn matches(&self) -> bool {
        self.source_tables == self.target_tables && self.source_rows == self.target_rows
    }
}

/// Exports and imports tenant data between PostgreSQL servers.
#[async_trait]
pub trait DataMover: Send + Sync {
    /// Consistent export of one tenant database.
    async fn export(&self, tenant_id: &str, source: &DatabaseLocation)
    -> CollaboratorResult<SnapshotRef>;

    async fn import(&self, snapshot: &SnapshotRef, target: &DatabaseLocation)
    -> CollaboratorResult<()>;

    async fn verify(
        &self,
        source: &DatabaseLocation,
        target: &DatabaseLocation,
    ) -> CollaboratorResult<VerifyReport>;
}

// ── Plan entitlements ─────────────────────────────────────────────

/// What a customer's plan allows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub customer_id: String,
    pub db_kind: PoolKind,
    pub resources: ResourceLimits,
    /// Opaque version token; changes whenever the plan changes.
    pub version: String,
}

/// Billing / plan lookup.
#[async_trait]
pub trait EntitlementSource: Send + Sync {
    async fn entitlement(&self, customer_id: &str) -> CollaboratorResult<Entitlement>;

    /// Current version token for a customer's plan, if the source can
    /// answer this more cheaply than a full lookup.
    async fn version(&self, _customer_id: &str) -> CollaboratorResult<Option<String>> {
        Ok(None)
    }
}

// ── Health probe ──────────────────────────────────────────────────

/// Liveness check of one PostgreSQL server.
#[async_trait]
pub trait PoolProber: Send + Sync {
    /// `Ok` when the server answered. Callers apply their own timeout.
    async fn probe(&self, endpoint: &Endpoint) -> CollaboratorResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_report_matches_only_when_counts_agree() {
        let mut report = VerifyReport {
            source_tables: 4,
            target_tables: 4,
            source_rows: 1200,
            target_rows: 1200,
        };
        assert!(report.matches());

        report.target_rows = 1199;
        assert!(!report.matches());

        report.target_rows = 1200;
        report.target_tables = 3;
        assert!(!report.matches());
    }
}
