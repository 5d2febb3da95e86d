//! pgfleet.toml configuration parser.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. Durations are strings such as `"2s"`, `"500ms"`, `"5m"`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::time::parse_duration;
use crate::types::ResourceLimits;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub planner: PlannerSettings,
    pub provision: ProvisionSettings,
    pub health: HealthSettings,
    pub migration: MigrationSettings,
    pub collaborators: CollaboratorEndpoints,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSettings {
    /// Selection retries after losing a reservation race.
    pub max_reserve_attempts: u32,
    /// Retry hint returned with `pending`.
    pub retry_after_secs: u64,
    /// Ceiling on waiting for the executor to create a tenant database.
    pub materialize_timeout: String,
    /// How long a cached entitlement is trusted without a version check.
    pub entitlement_ttl: String,
    /// Capacity of shared pools the planner asks to be provisioned.
    pub default_pool_capacity: u32,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            max_reserve_attempts: 3,
            retry_after_secs: 30,
            materialize_timeout: "2s".to_string(),
            entitlement_ttl: "5m".to_string(),
            default_pool_capacity: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionSettings {
    pub ready_poll_interval: String,
    pub ready_timeout: String,
    pub max_attempts: u32,
    pub backoff_base: String,
    pub backoff_max: String,
    /// Wall-clock ceiling for a whole provisioning job.
    pub job_deadline: String,
    /// How long a worker owns a claimed job before others may take it over.
    pub lease: String,
    pub worker_interval: String,
    /// Priority assigned to newly provisioned shared pools.
    pub pool_priority: u32,
    pub shared_resources: ResourceLimits,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            ready_poll_interval: "2s".to_string(),
            ready_timeout: "5m".to_string(),
            max_attempts: 3,
            backoff_base: "1s".to_string(),
            backoff_max: "30s".to_string(),
            job_deadline: "20m".to_string(),
            lease: "2m".to_string(),
            worker_interval: "5s".to_string(),
            pool_priority: 100,
            shared_resources: ResourceLimits {
                cpu_millis: 4000,
                memory_bytes: 8 * 1024 * 1024 * 1024,
                storage_gb: 200,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub interval: String,
    pub probe_timeout: String,
    /// Consecutive failures before a pool is marked degraded.
    pub degraded_after: u32,
    /// Consecutive failures before a pool is marked unhealthy.
    pub unhealthy_after: u32,
    /// Age after which a pool stuck in provisioning/initializing/error is flagged.
    pub stale_after: String,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: "15s".to_string(),
            probe_timeout: "2s".to_string(),
            degraded_after: 2,
            unhealthy_after: 3,
            stale_after: "30m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    /// Only allow moves to a strictly higher tier.
    pub upgrade_only: bool,
    /// Ceiling on obtaining the target allocation.
    pub target_timeout: String,
    /// Ceiling on any single collaborator call inside a phase.
    pub phase_timeout: String,
    pub worker_interval: String,
    pub lease: String,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            upgrade_only: true,
            target_timeout: "20m".to_string(),
            phase_timeout: "10m".to_string(),
            worker_interval: "5s".to_string(),
            lease: "30m".to_string(),
        }
    }
}

/// Base URLs of the external services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorEndpoints {
    pub executor_url: String,
    pub volumes_url: String,
    pub workload_url: String,
    pub mover_url: String,
    pub entitlements_url: String,
    pub request_timeout: String,
}

impl Default for CollaboratorEndpoints {
    fn default() -> Self {
        Self {
            executor_url: "http://127.0.0.1:7101".to_string(),
            volumes_url: "http://127.0.0.1:7102".to_string(),
            workload_url: "http://127.0.0.1:7103".to_string(),
            mover_url: "http://127.0.0.1:7104".to_string(),
            entitlements_url: "http://127.0.0.1:7105".to_string(),
            request_timeout: "30s".to_string(),
        }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Parse a configured duration, falling back to `default` when malformed.
pub fn duration_or(value: &str, default: Duration) -> Duration {
    parse_duration(value).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = FleetConfig::from_toml_str("").unwrap();
        assert_eq!(config.planner.max_reserve_attempts, 3);
        assert_eq!(config.planner.retry_after_secs, 30);
        assert_eq!(config.health.unhealthy_after, 3);
        assert!(config.migration.upgrade_only);
    }

    #[test]
    fn partial_sections_override_fields() {
        let toml_str = r#"
[planner]
retry_after_secs = 10

[health]
interval = "5s"
unhealthy_after = 5

[collaborators]
executor_url = "http://executor.internal:8080"
"#;
        let config = FleetConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.planner.retry_after_secs, 10);
        assert_eq!(config.planner.max_reserve_attempts, 3);
        assert_eq!(config.health.interval, "5s");
        assert_eq!(config.health.unhealthy_after, 5);
        assert_eq!(config.health.degraded_after, 2);
        assert_eq!(config.collaborators.executor_url, "http://executor.internal:8080");
    }

    #[test]
    fn round_trips_through_toml() {
        let config = FleetConfig::default();
        let rendered = config.to_toml_string().unwrap();
        let parsed = FleetConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.provision.max_attempts, config.provision.max_attempts);
        assert_eq!(parsed.provision.shared_resources, config.provision.shared_resources);
    }

    #[test]
    fn example_file_matches_defaults() {
        let example = include_str!("../../../pgfleet.example.toml");
        let parsed = FleetConfig::from_toml_str(example).unwrap();
        let defaults = FleetConfig::default();
        assert_eq!(parsed.to_toml_string().unwrap(), defaults.to_toml_string().unwrap());
    }

    #[test]
    fn malformed_duration_falls_back() {
        assert_eq!(duration_or("eventually", Duration::from_secs(7)), Duration::from_secs(7));
        assert_eq!(duration_or("3s", Duration::from_secs(7)), Duration::from_secs(3));
    }
}
