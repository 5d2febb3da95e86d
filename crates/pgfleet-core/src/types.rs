//! Types shared by every pgfleet crate.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What a PostgreSQL server is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Hosts many tenants' databases.
    Shared,
    /// Hosts exactly one tenant, owned by one customer.
    Dedicated,
    /// Internal platform server; never allocated to tenants.
    Platform,
}

impl PoolKind {
    /// Service tier used by the upgrade-only migration policy.
    /// `None` for kinds tenants can never be placed on.
    pub fn tier(self) -> Option<u8> {
        match self {
            PoolKind::Shared => Some(1),
            PoolKind::Dedicated => Some(2),
            PoolKind::Platform => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PoolKind::Shared => "shared",
            PoolKind::Dedicated => "dedicated",
            PoolKind::Platform => "platform",
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" => Ok(PoolKind::Shared),
            "dedicated" => Ok(PoolKind::Dedicated),
            "platform" => Ok(PoolKind::Platform),
            other => Err(format!("unknown pool kind: {other}")),
        }
    }
}

/// Resource limits for one PostgreSQL server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU in millicores.
    pub cpu_millis: u32,
    /// Memory limit in bytes.
    pub memory_bytes: u64,
    /// Persistent volume size in GiB.
    pub storage_gb: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_millis: 1000,
            memory_bytes: 2 * 1024 * 1024 * 1024,
            storage_gb: 20,
        }
    }
}

/// A network address of a PostgreSQL server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form for socket connects.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
