use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tandem_types::TenantId;
use tokio::sync::RwLock;

use crate::lock::TenantLock;
use crate::tenant_state::TenantState;

/// Everything private to one tenant's serialization chain: tenant state is
/// never touched outside the owning tenant's own lock and dispatch path.
pub struct TenantEntry {
    pub state: StdMutex<TenantState>,
    pub lock: TenantLock,
    in_flight: AtomicU32,
}

impl TenantEntry {
    fn new(now_ms: i64) -> Self {
        Self {
            state: StdMutex::new(TenantState::new(now_ms)),
            lock: TenantLock::new(),
            in_flight: AtomicU32::new(0),
        }
    }

    pub fn enter_run(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn exit_run(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn in_flight_count(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Cross-tenant shared resource: a read-heavy map from tenant id to its
/// private entry, behind a single `RwLock` since most operations are lookups
/// of an already-created tenant.
pub struct TenantStore {
    tenants: RwLock<HashMap<TenantId, Arc<TenantEntry>>>,
    idle_eviction_ms: Option<u64>,
}

impl TenantStore {
    pub fn new(idle_eviction_ms: Option<u64>) -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            idle_eviction_ms,
        }
    }

    /// `getOrCreate` plus idle eviction: creates the entry lazily,
    /// touches `last_activity_at`, and opportunistically sweeps idle
    /// tenants before returning.
    pub async fn get_or_create(&self, tenant_id: &TenantId, now_ms: i64) -> Arc<TenantEntry> {
        if let Some(entry) = self.tenants.read().await.get(tenant_id) {
            entry.state.lock().expect("tenant state mutex poisoned").touch(now_ms);
            self.sweep_idle(now_ms, Some(tenant_id)).await;
            return entry.clone();
        }

        let mut tenants = self.tenants.write().await;
        let entry = tenants
            .entry(tenant_id.clone())
            .or_insert_with(|| Arc::new(TenantEntry::new(now_ms)))
            .clone();
        entry.state.lock().expect("tenant state mutex poisoned").touch(now_ms);
        drop(tenants);
        self.sweep_idle(now_ms, Some(tenant_id)).await;
        entry
    }

    /// Never interrupts an in-flight run: only evicts entries with
    /// `in_flight_count == 0` that have been idle past the threshold.
    async fn sweep_idle(&self, now_ms: i64, keep: Option<&TenantId>) {
        let Some(threshold_ms) = self.idle_eviction_ms else {
            return;
        };
        if threshold_ms == 0 {
            return;
        }

        let mut tenants = self.tenants.write().await;
        tenants.retain(|tenant_id, entry| {
            if Some(tenant_id) == keep {
                return true;
            }
            if entry.in_flight_count() > 0 {
                return true;
            }
            let last_activity = entry
                .state
                .lock()
                .expect("tenant state mutex poisoned")
                .last_activity_at;
            now_ms.saturating_sub(last_activity) < threshold_ms as i64
        });
    }

    #[cfg(test)]
    pub async fn tenant_count(&self) -> usize {
        self.tenants.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_is_lazy_and_stable() {
        let store = TenantStore::new(None);
        let tenant = TenantId::new("t1");
        let a = store.get_or_create(&tenant, 0).await;
        let b = store.get_or_create(&tenant, 10).await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn idle_eviction_drops_tenants_past_threshold_with_no_in_flight() {
        let store = TenantStore::new(Some(100));
        let idle_tenant = TenantId::new("idle");
        store.get_or_create(&idle_tenant, 0).await;

        let active_tenant = TenantId::new("active");
        store.get_or_create(&active_tenant, 500).await;

        assert_eq!(store.tenant_count().await, 1);
    }

    #[tokio::test]
    async fn idle_eviction_never_drops_in_flight_tenant() {
        let store = TenantStore::new(Some(100));
        let busy = TenantId::new("busy");
        let entry = store.get_or_create(&busy, 0).await;
        entry.enter_run();

        let other = TenantId::new("other");
        store.get_or_create(&other, 500).await;

        assert_eq!(store.tenant_count().await, 2);
        entry.exit_run();
    }
}
