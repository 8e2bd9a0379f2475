use std::sync::atomic::{AtomicU64, Ordering};

use tandem_types::{RunId, TenantId};

/// Injectable id generation. The default produces globally unique
/// ids within the process — a monotonic counter plus a random suffix,
/// similar to the `ralph_<uuid>` scheme used elsewhere in this workspace
/// for background task ids.
pub trait RunIdGenerator: Send + Sync {
    fn generate(&self, tenant_id: &TenantId) -> RunId;
}

pub struct DefaultRunIdGenerator {
    counter: AtomicU64,
}

impl DefaultRunIdGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for DefaultRunIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RunIdGenerator for DefaultRunIdGenerator {
    fn generate(&self, tenant_id: &TenantId) -> RunId {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        RunId::new(format!("run_{}_{seq}_{suffix}", tenant_id.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_per_tenant() {
        let gen = DefaultRunIdGenerator::new();
        let tenant = TenantId::new("t1");
        let a = gen.generate(&tenant);
        let b = gen.generate(&tenant);
        assert_ne!(a, b);
    }
}
