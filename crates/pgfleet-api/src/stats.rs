//! Fleet capacity statistics for the pool listing.

use std::collections::BTreeMap;

use serde::Serialize;

use pgfleet_state::PoolRecord;

/// Aggregate capacity over a set of pools.
///
/// Capacity and usage count only pools that are serving (`active`,
/// `full`, `degraded`); the per-status and per-kind counts include every
/// pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub total_pools: usize,
    pub total_capacity: u64,
    pub total_used: u64,
    pub utilization_percent: f64,
    pub by_status: BTreeMap<String, usize>,
    pub by_kind: BTreeMap<String, usize>,
}

impl PoolStats {
    pub fn from_pools(pools: &[PoolRecord]) -> Self {
        let mut by_status = BTreeMap::new();
        let mut by_kind = BTreeMap::new();
        let mut total_capacity = 0u64;
        let mut total_used = 0u64;

        for pool in pools {
            *by_status.entry(pool.status.as_str().to_string()).or_insert(0) += 1;
            *by_kind.entry(pool.kind.as_str().to_string()).or_insert(0) += 1;
            if pool.status.is_serving() {
                total_capacity += u64::from(pool.max_instances);
                total_used += u64::from(pool.current_instances);
            }
        }

        let utilization_percent = if total_capacity > 0 {
            let percent = total_used as f64 / total_capacity as f64 * 100.0;
            (percent * 10.0).round() / 10.0
        } else {
            0.0
        };

        Self {
            total_pools: pools.len(),
            total_capacity,
            total_used,
            utilization_percent,
            by_status,
            by_kind,
        }
    }
}
