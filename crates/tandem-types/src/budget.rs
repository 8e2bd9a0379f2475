use serde::{Deserialize, Serialize};

/// Per-tenant rate/consumption envelope. Immutable for the lifetime of the
/// runtime config; see `TenantState` for the mutable ledgers it bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantBudget {
    pub max_runs_per_hour: u32,
    pub max_tokens_per_day: u64,
}

/// Consecutive-failure threshold and cooldown for the per-tenant circuit
/// breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}
