//! Read-through cache in front of the plan entitlement source.
//!
//! A cached entry is served as-is while younger than the TTL. After that
//! the source's version token is checked first; an unchanged version
//! renews the entry without a full lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use pgfleet_core::{CollaboratorResult, Entitlement, EntitlementSource, PoolKind};

struct CachedEntry {
    entitlement: Entitlement,
    fetched_at: Instant,
}

pub struct CachedEntitlements {
    source: Arc<dyn EntitlementSource>,
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedEntry>>,
}

impl CachedEntitlements {
    pub fn new(source: Arc<dyn EntitlementSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, customer_id: &str) -> CollaboratorResult<Entitlement> {
        let cached = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries
                .get(customer_id)
                .map(|e| (e.entitlement.clone(), e.fetched_at.elapsed() < self.ttl))
        };

        if let Some((entitlement, fresh)) = cached {
            if fresh {
                return Ok(entitlement);
            }
            if let Some(version) = self.source.version(customer_id).await?
                && version == entitlement.version
            {
                debug!(%customer_id, %version, "entitlement version unchanged");
                self.store(entitlement.clone());
                return Ok(entitlement);
            }
        }

        let entitlement = self.source.entitlement(customer_id).await?;
        debug!(%customer_id, version = %entitlement.version, kind = %entitlement.db_kind, "entitlement fetched");
        self.store(entitlement.clone());
        Ok(entitlement)
    }

    /// Drop a customer's entry, e.g. after a plan change notification.
    pub fn invalidate(&self, customer_id: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(customer_id);
    }

    fn store(&self, entitlement: Entitlement) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).insert(
            entitlement.customer_id.clone(),
            CachedEntry {
                entitlement,
                fetched_at: Instant::now(),
            },
        );
    }
}

/// Whether a plan covers databases of `kind`. A plan includes its own
/// tier and every lower one; platform pools are never included.
pub fn permits(entitlement: &Entitlement, kind: PoolKind) -> bool {
    match (kind.tier(), entitlement.db_kind.tier()) {
        (Some(requested), Some(plan)) => requested <= plan,
        _ => false,
    }
}
