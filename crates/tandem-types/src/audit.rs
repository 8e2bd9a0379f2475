use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{RunId, TenantId};

/// Tag for an `AuditEvent`. Mirrors the executor/scheduler state transitions
/// that are observable from outside the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    RunStarted,
    RunCompleted,
    RunBlockedBudget,
    RunBlockedCircuitBreaker,
    RunBlockedKillSwitch,
    RunError,
    RunMaxLockHoldReleased,
    CircuitBreakerOpened,
    CircuitBreakerRecovered,
}

/// One emitted audit record. `run_id` is `None` for events that precede run
/// id allocation (currently none do, but the field stays optional per the
/// data model contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub event: AuditEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, Value>>,
    pub at_ms: i64,
}

impl AuditEvent {
    pub fn new(tenant_id: TenantId, event: AuditEventKind, at_ms: i64) -> Self {
        Self {
            tenant_id,
            run_id: None,
            event,
            data: None,
            at_ms,
        }
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }
}
