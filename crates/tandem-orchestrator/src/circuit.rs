use tandem_types::CircuitConfig;

use crate::tenant_state::TenantState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitDecision {
    /// Breaker is not tripped; a run may proceed.
    Closed,
    /// Cooldown just elapsed on this check — the caller should emit
    /// `circuit_breaker_recovered` and proceed with a run.
    JustRecovered,
    /// Breaker is open and still within cooldown.
    Open,
}

impl CircuitDecision {
    pub fn blocks_run(self) -> bool {
        matches!(self, CircuitDecision::Open)
    }
}

/// Mutates `state.circuit_opened_at` on
/// recovery (clearing it), which is why this isn't a pure function of
/// `&TenantState` the way `budget::evaluate` is — the circuit breaker is a
/// state machine, and recovery is itself a state transition.
pub fn evaluate(config: Option<&CircuitConfig>, state: &mut TenantState, now_ms: i64) -> CircuitDecision {
    let Some(config) = config else {
        return CircuitDecision::Closed;
    };

    let Some(opened_at) = state.circuit_opened_at else {
        return CircuitDecision::Closed;
    };

    if now_ms.saturating_sub(opened_at) >= config.cooldown_ms as i64 {
        state.circuit_opened_at = None;
        return CircuitDecision::JustRecovered;
    }

    CircuitDecision::Open
}

/// Bumps the failure counter and trips the breaker
/// once `failure_threshold` is reached. Returns `true` if this call is
/// what opened it, so the caller can emit `circuit_breaker_opened` exactly
/// once.
pub fn record_failure(config: Option<&CircuitConfig>, state: &mut TenantState, now_ms: i64) -> bool {
    state.record_failure();

    let Some(config) = config else {
        return false;
    };

    if state.circuit_opened_at.is_none() && state.consecutive_failures >= config.failure_threshold
    {
        state.circuit_opened_at = Some(now_ms);
        return true;
    }

    false
}
