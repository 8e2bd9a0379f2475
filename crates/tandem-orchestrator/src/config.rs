use std::collections::HashMap;

use tandem_types::{CircuitConfig, KillSwitch, TenantBudget, TenantId};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid configuration field {field}: {reason}")]
pub struct ConfigInvalid {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigInvalid {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Runtime configuration. Deserializable so it can be loaded the
/// same way the rest of the workspace layers JSON/YAML config, though this
/// crate only needs in-memory construction plus `validate`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RuntimeConfig {
    pub heartbeat_interval_ms: u64,
    #[serde(default)]
    pub tenant_budgets: HashMap<TenantId, TenantBudget>,
    #[serde(default)]
    pub circuit_breaker_config: HashMap<TenantId, CircuitConfig>,
    #[serde(skip)]
    pub kill_switch: Option<KillSwitch>,
    #[serde(default = "default_max_event_queue_size")]
    pub max_event_queue_size: usize,
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
    #[serde(default)]
    pub run_timeout_grace_ms: Option<u64>,
    #[serde(default)]
    pub run_timeout_max_lock_hold_ms: Option<u64>,
    #[serde(default = "default_run_timeout_charge_tokens")]
    pub run_timeout_charge_tokens: u64,
    #[serde(default)]
    pub tenant_idle_eviction_ms: Option<u64>,
}

fn default_max_event_queue_size() -> usize {
    100
}

fn default_run_timeout_ms() -> u64 {
    300_000
}

fn default_run_timeout_charge_tokens() -> u64 {
    512
}

impl RuntimeConfig {
    pub fn new(heartbeat_interval_ms: u64) -> Self {
        Self {
            heartbeat_interval_ms,
            tenant_budgets: HashMap::new(),
            circuit_breaker_config: HashMap::new(),
            kill_switch: None,
            max_event_queue_size: default_max_event_queue_size(),
            run_timeout_ms: default_run_timeout_ms(),
            run_timeout_grace_ms: None,
            run_timeout_max_lock_hold_ms: None,
            run_timeout_charge_tokens: default_run_timeout_charge_tokens(),
            tenant_idle_eviction_ms: None,
        }
    }

    pub fn with_tenant_budget(mut self, tenant_id: TenantId, budget: TenantBudget) -> Self {
        self.tenant_budgets.insert(tenant_id, budget);
        self
    }

    pub fn with_circuit_breaker(mut self, tenant_id: TenantId, cfg: CircuitConfig) -> Self {
        self.circuit_breaker_config.insert(tenant_id, cfg);
        self
    }

    pub fn with_kill_switch(mut self, kill_switch: KillSwitch) -> Self {
        self.kill_switch = Some(kill_switch);
        self
    }

    /// Resolves the `= runTimeoutMs` / `= runTimeoutGraceMs` defaults that
    /// reference sibling fields, not literal constants.
    pub fn run_timeout_grace_ms(&self) -> u64 {
        self.run_timeout_grace_ms.unwrap_or(self.run_timeout_ms)
    }

    pub fn run_timeout_max_lock_hold_ms(&self) -> u64 {
        self.run_timeout_max_lock_hold_ms
            .unwrap_or_else(|| self.run_timeout_grace_ms())
    }

    /// Fails fast with `ConfigInvalid`. Called once at `Scheduler::new`.
    pub fn validate(&self) -> Result<(), ConfigInvalid> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigInvalid::new(
                "heartbeat_interval_ms",
                "must be a positive number of milliseconds",
            ));
        }
        if self.max_event_queue_size < 1 {
            return Err(ConfigInvalid::new(
                "max_event_queue_size",
                "must be >= 1",
            ));
        }
        if self.run_timeout_ms < 1 {
            return Err(ConfigInvalid::new("run_timeout_ms", "must be >= 1"));
        }
        // run_timeout_grace_ms / run_timeout_max_lock_hold_ms / run_timeout_charge_tokens
        // / tenant_idle_eviction_ms are unsigned types here, so a negative
        // value for any of them is unrepresentable by construction.
        Ok(())
    }
}
