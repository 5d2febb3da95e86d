//! Atomic capacity accounting on top of [`StateStore::update_pool`].
//!
//! Each operation is one guarded update, i.e. one redb write transaction:
//! the capacity check, the counter change, and the `active`/`full` status
//! recomputation commit together or not at all.

use tracing::{debug, warn};

use crate::error::StateResult;
use crate::store::StateStore;
use crate::types::PoolStatus;

/// Reserves and releases tenant slots on pools.
#[derive(Clone)]
pub struct CapacityTracker {
    store: StateStore,
}

impl CapacityTracker {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Take one slot on `pool_id`.
    ///
    /// Succeeds only if the pool is `active` and below `max_instances`.
    /// Returns `false` when the guard rejects the reservation (lost race,
    /// pool full, pool not active).
    pub fn reserve(&self, pool_id: &str) -> StateResult<bool> {
        let update = self.store.update_pool(pool_id, |pool| {
            if pool.status != PoolStatus::Active || !pool.has_capacity() {
                return false;
            }
            pool.current_instances += 1;
            pool.status = pool.capacity_status();
            true
        })?;

        if update.applied {
            debug!(
                pool_id,
                current = update.record.current_instances,
                max = update.record.max_instances,
                status = update.record.status.as_str(),
                "slot reserved"
            );
        }
        Ok(update.applied)
    }

    /// Return one slot to `pool_id`. The counter never goes below zero.
    pub fn release(&self, pool_id: &str) -> StateResult<()> {
        let update = self.store.update_pool(pool_id, |pool| {
            if pool.current_instances == 0 {
                return false;
            }
            pool.current_instances -= 1;
            pool.status = pool.capacity_status();
            true
        })?;

        if update.applied {
            debug!(
                pool_id,
                current = update.record.current_instances,
                status = update.record.status.as_str(),
                "slot released"
            );
        } else {
            warn!(pool_id, "release on a pool with no reserved slots");
        }
        Ok(())
    }

    /// Re-derive `active`/`full` from the stored count.
    pub fn recompute_status(&self, pool_id: &str) -> StateResult<PoolStatus> {
        let update = self.store.update_pool(pool_id, |pool| {
            let status = pool.capacity_status();
            if status == pool.status {
                return false;
            }
            pool.status = status;
            true
        })?;
        Ok(update.record.status)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::testutil::shared_pool;
    use crate::types::HealthStatus;

    fn tracker_with(current: u32, max: u32) -> CapacityTracker {
        let store = StateStore::open_in_memory().unwrap();
        store.put_pool(&shared_pool("pool-1", current, max)).unwrap();
        CapacityTracker::new(store)
    }

    #[test]
    fn last_slot_flips_pool_to_full() {
        let tracker = tracker_with(49, 50);

        assert!(tracker.reserve("pool-1").unwrap());
        let pool = tracker.store().get_pool("pool-1").unwrap().unwrap();
        assert_eq!(pool.current_instances, 50);
        assert_eq!(pool.status, PoolStatus::Full);

        // Full pools take no more.
        assert!(!tracker.reserve("pool-1").unwrap());
    }

    #[test]
    fn release_reopens_full_pool() {
        let tracker = tracker_with(49, 50);
        tracker.reserve("pool-1").unwrap();

        tracker.release("pool-1").unwrap();
        let pool = tracker.store().get_pool("pool-1").unwrap().unwrap();
        assert_eq!(pool.current_instances, 49);
        assert_eq!(pool.status, PoolStatus::Active);
    }

    #[test]
    fn release_saturates_at_zero() {
        let tracker = tracker_with(0, 50);
        tracker.release("pool-1").unwrap();
        assert_eq!(
            tracker.store().get_pool("pool-1").unwrap().unwrap().current_instances,
            0
        );
    }

    #[test]
    fn reserve_requires_active_pool() {
        let tracker = tracker_with(0, 50);
        tracker
            .store()
            .update_pool("pool-1", |p| {
                p.status = PoolStatus::Initializing;
                true
            })
            .unwrap();
        assert!(!tracker.reserve("pool-1").unwrap());
    }

    #[test]
    fn reserve_on_missing_pool_is_an_error() {
        let tracker = tracker_with(0, 50);
        assert!(tracker.reserve("ghost").is_err());
    }

    #[test]
    fn recompute_fixes_stale_status() {
        let tracker = tracker_with(10, 50);
        tracker
            .store()
            .update_pool("pool-1", |p| {
                p.status = PoolStatus::Full;
                true
            })
            .unwrap();
        assert_eq!(tracker.recompute_status("pool-1").unwrap(), PoolStatus::Active);

        // Lifecycle states other than active/full are left alone.
        tracker
            .store()
            .update_pool("pool-1", |p| {
                p.status = PoolStatus::Degraded;
                p.health = HealthStatus::Unhealthy;
                true
            })
            .unwrap();
        assert_eq!(tracker.recompute_status("pool-1").unwrap(), PoolStatus::Degraded);
    }

    #[test]
    fn hundred_parallel_reserves_fill_exactly_fifty() {
        let tracker = tracker_with(0, 50);
        let wins = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let tracker = tracker.clone();
                let wins = wins.clone();
                std::thread::spawn(move || {
                    if tracker.reserve("pool-1").unwrap() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 50);
        let pool = tracker.store().get_pool("pool-1").unwrap().unwrap();
        assert_eq!(pool.current_instances, 50);
        assert_eq!(pool.status, PoolStatus::Full);
    }
}
