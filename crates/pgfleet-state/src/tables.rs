//! redb table definitions for the pool registry.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Pool records keyed by `{pool_id}`.
pub const POOLS: JsonTable = TableDefinition::new("pools");

/// Tenant allocations keyed by `{tenant_id}`.
pub const TENANTS: JsonTable = TableDefinition::new("tenants");

/// Provisioning jobs keyed by `{job_id}`.
pub const PROVISIONING_JOBS: JsonTable = TableDefinition::new("provisioning_jobs");

/// Migration jobs keyed by `{job_id}`.
pub const MIGRATION_JOBS: JsonTable = TableDefinition::new("migration_jobs");
