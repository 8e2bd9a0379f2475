use std::sync::Arc;
use std::time::Duration;

use tandem_types::{AuditEvent, AuditEventKind, Clock, KillSwitch, RunContext, RunStatus, TenantId};
use tandem_providers::RunProvider;
use tokio::task::JoinHandle;

use crate::audit::{self, AuditSink};
use crate::budget;
use crate::circuit;
use crate::config::RuntimeConfig;
use crate::ids::RunIdGenerator;
use crate::store::TenantStore;

/// Drives a single agent run end-to-end. Invoked by the scheduler;
/// never called by consumers directly.
pub struct RunExecutor {
    store: Arc<TenantStore>,
    config: Arc<RuntimeConfig>,
    provider: Arc<dyn RunProvider>,
    audit_sink: Arc<dyn AuditSink>,
    run_ids: Arc<dyn RunIdGenerator>,
    clock: Arc<dyn Clock>,
    kill_switch: Option<KillSwitch>,
}

impl RunExecutor {
    pub fn new(
        store: Arc<TenantStore>,
        config: Arc<RuntimeConfig>,
        provider: Arc<dyn RunProvider>,
        audit_sink: Arc<dyn AuditSink>,
        run_ids: Arc<dyn RunIdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let kill_switch = config.kill_switch.clone();
        Self {
            store,
            config,
            provider,
            audit_sink,
            run_ids,
            clock,
            kill_switch,
        }
    }

    async fn emit(&self, event: AuditEvent) {
        audit::emit(self.audit_sink.as_ref(), event).await;
    }

    /// Never returns an error for reasons related to a specific
    /// run's outcome — failures are only observable through audit events.
    pub async fn execute(&self, tenant_id: &TenantId) {
        let now = self.clock.now_ms();
        let entry = self.store.get_or_create(tenant_id, now).await;

        if self.kill_switch.as_ref().is_some_and(KillSwitch::is_enabled) {
            self.emit(AuditEvent::new(
                tenant_id.clone(),
                AuditEventKind::RunBlockedKillSwitch,
                now,
            ))
            .await;
            return;
        }

        let run_id = self.run_ids.generate(tenant_id);

        let circuit_cfg = self.config.circuit_breaker_config.get(tenant_id);
        let budget_cfg = self.config.tenant_budgets.get(tenant_id);

        // Budget is evaluated first, and, critically, before
        // the circuit breaker is even consulted: a denied-by-budget run must
        // not have the side effect of clearing a would-be-recovered circuit.
        let budget_decision = {
            let mut state = entry.state.lock().expect("tenant state mutex poisoned");
            state.prune_runs(now);
            state.prune_tokens(now);
            budget::evaluate(budget_cfg, &state)
        };

        if !budget_decision.is_allowed() {
            let event = match budget_decision {
                budget::BudgetDecision::DeniedRuns { used, max } => {
                    AuditEvent::new(tenant_id.clone(), AuditEventKind::RunBlockedBudget, now)
                        .with_run_id(run_id)
                        .with_data("used", used as u64)
                        .with_data("max", max)
                }
                budget::BudgetDecision::DeniedTokens { used, max } => {
                    AuditEvent::new(tenant_id.clone(), AuditEventKind::RunBlockedBudget, now)
                        .with_run_id(run_id)
                        .with_data("used", used)
                        .with_data("max", max)
                }
                budget::BudgetDecision::Allowed => unreachable!(),
            };
            self.emit(event).await;
            return;
        }

        let circuit_decision = {
            let mut state = entry.state.lock().expect("tenant state mutex poisoned");
            circuit::evaluate(circuit_cfg, &mut state, now)
        };

        if circuit_decision == circuit::CircuitDecision::JustRecovered {
            self.emit(AuditEvent::new(
                tenant_id.clone(),
                AuditEventKind::CircuitBreakerRecovered,
                now,
            ))
            .await;
        }

        if circuit_decision.blocks_run() {
            self.emit(
                AuditEvent::new(tenant_id.clone(), AuditEventKind::RunBlockedCircuitBreaker, now)
                    .with_run_id(run_id),
            )
            .await;
            return;
        }

        self.emit(AuditEvent::new(tenant_id.clone(), AuditEventKind::RunStarted, now).with_run_id(run_id.clone()))
            .await;

        let guard = entry.lock.acquire().await;
        entry.enter_run();

        let ctx = RunContext::new(tenant_id.clone(), run_id.clone());
        let cancellation = ctx.cancellation.clone();
        let provider = self.provider.clone();
        let handle: JoinHandle<anyhow::Result<tandem_types::RunOutcome>> =
            tokio::spawn(async move { provider.run_once(&ctx).await });

        let timeout = Duration::from_millis(self.config.run_timeout_ms);
        tokio::pin!(handle);

        tokio::select! {
            join_result = &mut handle => {
                entry.exit_run();
                self.settle(tenant_id, &entry, &run_id, join_result).await;
                guard.release();
            }
            _ = tokio::time::sleep(timeout) => {
                cancellation.cancel();
                let now = self.clock.now_ms();
                let opened = {
                    let mut state = entry.state.lock().expect("tenant state mutex poisoned");
                    circuit::record_failure(circuit_cfg, &mut state, now)
                };
                self.emit(
                    AuditEvent::new(tenant_id.clone(), AuditEventKind::RunError, now)
                        .with_run_id(run_id.clone())
                        .with_data("error", format!("Run timeout after {}ms", self.config.run_timeout_ms)),
                )
                .await;
                if opened {
                    self.emit(
                        AuditEvent::new(tenant_id.clone(), AuditEventKind::CircuitBreakerOpened, now)
                            .with_run_id(run_id.clone()),
                    )
                    .await;
                }

                self.grace_phase(tenant_id, &entry, &run_id, handle, guard).await;
                entry.exit_run();
            }
        }
    }

    /// Bookkeeping shared by the happy path and by a late settlement inside
    /// the grace phase: charges tokens, updates the
    /// failure counter, and emits the terminal audit event.
    async fn settle(
        &self,
        tenant_id: &TenantId,
        entry: &crate::store::TenantEntry,
        run_id: &tandem_types::RunId,
        join_result: Result<anyhow::Result<tandem_types::RunOutcome>, tokio::task::JoinError>,
    ) {
        let now = self.clock.now_ms();
        let circuit_cfg = self.config.circuit_breaker_config.get(tenant_id);
        let budget_cfg = self.config.tenant_budgets.get(tenant_id);

        match join_result {
            Ok(Ok(outcome)) => {
                let tokens = outcome.tokens_used();
                let opened = {
                    let mut state = entry.state.lock().expect("tenant state mutex poisoned");
                    if budget_cfg.is_some() {
                        state.record_run(now, tokens);
                    }
                    if outcome.status == RunStatus::Error {
                        circuit::record_failure(circuit_cfg, &mut state, now)
                    } else {
                        state.record_success();
                        false
                    }
                };
                self.emit(
                    AuditEvent::new(tenant_id.clone(), AuditEventKind::RunCompleted, now)
                        .with_run_id(run_id.clone())
                        .with_data("status", format!("{:?}", outcome.status))
                        .with_data("tokens_used", tokens),
                )
                .await;
                if opened {
                    self.emit(
                        AuditEvent::new(tenant_id.clone(), AuditEventKind::CircuitBreakerOpened, now)
                            .with_run_id(run_id.clone()),
                    )
                    .await;
                }
            }
            Ok(Err(_provider_err)) => {
                let opened = {
                    let mut state = entry.state.lock().expect("tenant state mutex poisoned");
                    circuit::record_failure(circuit_cfg, &mut state, now)
                };
                self.emit(
                    AuditEvent::new(tenant_id.clone(), AuditEventKind::RunError, now).with_run_id(run_id.clone()),
                )
                .await;
                if opened {
                    self.emit(
                        AuditEvent::new(tenant_id.clone(), AuditEventKind::CircuitBreakerOpened, now)
                            .with_run_id(run_id.clone()),
                    )
                    .await;
                }
            }
            Err(_join_err) => {
                let opened = {
                    let mut state = entry.state.lock().expect("tenant state mutex poisoned");
                    circuit::record_failure(circuit_cfg, &mut state, now)
                };
                self.emit(
                    AuditEvent::new(tenant_id.clone(), AuditEventKind::RunError, now).with_run_id(run_id.clone()),
                )
                .await;
                if opened {
                    self.emit(
                        AuditEvent::new(tenant_id.clone(), AuditEventKind::CircuitBreakerOpened, now)
                            .with_run_id(run_id.clone()),
                    )
                    .await;
                }
            }
        }
    }

    /// Retains the lock past the initial timeout, bounded by
    /// `runTimeoutMaxLockHoldMs`, while the orphaned provider task keeps
    /// running in the background.
    async fn grace_phase(
        &self,
        tenant_id: &TenantId,
        entry: &Arc<crate::store::TenantEntry>,
        run_id: &tandem_types::RunId,
        mut handle: std::pin::Pin<&mut JoinHandle<anyhow::Result<tandem_types::RunOutcome>>>,
        guard: crate::lock::TenantLockGuard,
    ) {
        let grace = Duration::from_millis(self.config.run_timeout_grace_ms());
        let max_hold = Duration::from_millis(self.config.run_timeout_max_lock_hold_ms());
        let budget_cfg = self.config.tenant_budgets.get(tenant_id);

        // Both bounds are measured from the same origin (the moment the
        // original timeout fired), so whichever is shorter governs how long
        // we wait before the first decision point — not `grace` unconditionally.
        let first_bound = grace.min(max_hold);

        let settled = tokio::select! {
            join_result = &mut handle => Some(join_result),
            _ = tokio::time::sleep(first_bound) => None,
        };

        if let Some(join_result) = settled {
            let tokens = match &join_result {
                Ok(Ok(outcome)) => outcome.tokens_used(),
                _ => 0,
            };
            let now = self.clock.now_ms();
            if budget_cfg.is_some() {
                let mut state = entry.state.lock().expect("tenant state mutex poisoned");
                state.charge_tokens(now, tokens);
            }
            guard.release();
            return;
        }

        // Nothing settled by `first_bound`. If that bound was the max-hold
        // budget itself (max_hold <= grace), we've already exhausted the
        // entire lock-holding allowance and must force-release immediately,
        // regardless of whether grace would otherwise still have time left.
        let charge_tokens = self.config.run_timeout_charge_tokens;
        if max_hold <= grace {
            if budget_cfg.is_some() {
                let now = self.clock.now_ms();
                let mut state = entry.state.lock().expect("tenant state mutex poisoned");
                state.charge_tokens(now, charge_tokens);
            }
            guard.release();
            let now = self.clock.now_ms();
            self.emit(
                AuditEvent::new(tenant_id.clone(), AuditEventKind::RunMaxLockHoldReleased, now)
                    .with_run_id(run_id.clone())
                    .with_data("tokens_used", charge_tokens),
            )
            .await;
            return;
        }

        // `first_bound` was grace elapsing with max-hold budget still
        // remaining: charge the default and keep holding the lock until that
        // remaining budget expires.
        if budget_cfg.is_some() {
            let now = self.clock.now_ms();
            let mut state = entry.state.lock().expect("tenant state mutex poisoned");
            state.charge_tokens(now, charge_tokens);
        }

        let remaining = max_hold - grace;
        tokio::select! {
            _join_result = &mut handle => {
                // Late settlement after the charge already happened; its
                // outcome is drained but does not affect bookkeeping further
                // since the generation has moved on.
            }
            _ = tokio::time::sleep(remaining) => {}
        }

        guard.release();
        let now = self.clock.now_ms();
        self.emit(
            AuditEvent::new(tenant_id.clone(), AuditEventKind::RunMaxLockHoldReleased, now)
                .with_run_id(run_id.clone())
                .with_data("tokens_used", charge_tokens),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tandem_types::{ManualClock, RunOutcome, TenantBudget};

    use super::*;
    use crate::audit::VecAuditSink;
    use crate::ids::DefaultRunIdGenerator;

    struct ScriptedProvider {
        status: RunStatus,
        tokens: u64,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RunProvider for ScriptedProvider {
        async fn run_once(&self, _ctx: &RunContext) -> anyhow::Result<RunOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RunOutcome {
                status: self.status,
                tokens_used: Some(self.tokens),
                payload: None,
            })
        }
    }

    fn executor(
        provider: Arc<dyn RunProvider>,
        config: RuntimeConfig,
        sink: Arc<VecAuditSink>,
        clock: Arc<ManualClock>,
    ) -> (RunExecutor, Arc<TenantStore>) {
        let store = Arc::new(TenantStore::new(config.tenant_idle_eviction_ms));
        let executor = RunExecutor::new(
            store.clone(),
            Arc::new(config),
            provider,
            sink,
            Arc::new(DefaultRunIdGenerator::new()),
            clock,
        );
        (executor, store)
    }

    #[tokio::test(start_paused = true)]
    async fn successful_run_records_completion_and_tokens() {
        let provider = Arc::new(ScriptedProvider {
            status: RunStatus::Completed,
            tokens: 100,
            calls: AtomicU32::new(0),
        });
        let sink = Arc::new(VecAuditSink::new());
        let clock = Arc::new(ManualClock::new(0));
        let tenant = TenantId::new("t1");
        let config = RuntimeConfig::new(1000).with_tenant_budget(
            tenant.clone(),
            TenantBudget {
                max_runs_per_hour: 10,
                max_tokens_per_day: 10_000,
            },
        );
        let (executor, _store) = executor(provider, config, sink.clone(), clock);

        executor.execute(&tenant).await;

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, AuditEventKind::RunStarted);
        assert_eq!(events[1].event, AuditEventKind::RunCompleted);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_emit_circuit_breaker_opened() {
        let provider = Arc::new(ScriptedProvider {
            status: RunStatus::Error,
            tokens: 0,
            calls: AtomicU32::new(0),
        });
        let sink = Arc::new(VecAuditSink::new());
        let clock = Arc::new(ManualClock::new(0));
        let tenant = TenantId::new("t1");
        let mut config = RuntimeConfig::new(1000);
        config.circuit_breaker_config.insert(
            tenant.clone(),
            tandem_types::CircuitConfig {
                failure_threshold: 2,
                cooldown_ms: 5000,
            },
        );
        let (executor, _store) = executor(provider, config, sink.clone(), clock);

        executor.execute(&tenant).await;
        assert_eq!(sink.count(AuditEventKind::CircuitBreakerOpened), 0);

        executor.execute(&tenant).await;
        assert_eq!(sink.count(AuditEventKind::CircuitBreakerOpened), 1);

        let events = sink.events();
        assert_eq!(events.last().unwrap().event, AuditEventKind::CircuitBreakerOpened);
    }

    #[tokio::test(start_paused = true)]
    async fn kill_switch_blocks_before_run_started() {
        let provider = Arc::new(ScriptedProvider {
            status: RunStatus::Completed,
            tokens: 0,
            calls: AtomicU32::new(0),
        });
        let sink = Arc::new(VecAuditSink::new());
        let clock = Arc::new(ManualClock::new(0));
        let tenant = TenantId::new("t1");
        let config = RuntimeConfig::new(1000).with_kill_switch(KillSwitch::new(true));
        let (executor, _store) = executor(provider, config, sink.clone(), clock);

        executor.execute(&tenant).await;

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, AuditEventKind::RunBlockedKillSwitch);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_denial_blocks_run_without_calling_provider() {
        let provider = Arc::new(ScriptedProvider {
            status: RunStatus::Completed,
            tokens: 1,
            calls: AtomicU32::new(0),
        });
        let sink = Arc::new(VecAuditSink::new());
        let clock = Arc::new(ManualClock::new(0));
        let tenant = TenantId::new("t1");
        let config = RuntimeConfig::new(1000).with_tenant_budget(
            tenant.clone(),
            TenantBudget {
                max_runs_per_hour: 0,
                max_tokens_per_day: 10_000,
            },
        );
        let (executor, _store) = executor(provider.clone(), config, sink.clone(), clock);

        executor.execute(&tenant).await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, AuditEventKind::RunBlockedBudget);
    }

    struct HangingProvider;

    #[async_trait]
    impl RunProvider for HangingProvider {
        async fn run_once(&self, ctx: &RunContext) -> anyhow::Result<RunOutcome> {
            ctx.cancellation.cancelled().await;
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_then_max_lock_hold_release_emits_expected_events() {
        let provider = Arc::new(HangingProvider);
        let sink = Arc::new(VecAuditSink::new());
        let clock = Arc::new(ManualClock::new(0));
        let tenant = TenantId::new("t1");
        let mut config = RuntimeConfig::new(1000);
        config.run_timeout_ms = 50;
        config.run_timeout_grace_ms = Some(100);
        config.run_timeout_max_lock_hold_ms = Some(80);
        let (executor, _store) = executor(provider, config, sink.clone(), clock);

        executor.execute(&tenant).await;

        let events = sink.events();
        let kinds: Vec<_> = events.iter().map(|e| e.event).collect();
        assert!(kinds.contains(&AuditEventKind::RunStarted));
        assert!(kinds.contains(&AuditEventKind::RunError));
        assert!(kinds.contains(&AuditEventKind::RunMaxLockHoldReleased));
    }

    #[tokio::test(start_paused = true)]
    async fn max_lock_hold_shorter_than_grace_bounds_total_lock_hold() {
        let provider = Arc::new(HangingProvider);
        let sink = Arc::new(VecAuditSink::new());
        let clock = Arc::new(ManualClock::new(0));
        let tenant = TenantId::new("t1");
        let mut config = RuntimeConfig::new(1000);
        config.run_timeout_ms = 50;
        config.run_timeout_grace_ms = Some(100);
        config.run_timeout_max_lock_hold_ms = Some(80);
        let (executor, _store) = executor(provider, config, sink.clone(), clock);

        let start = tokio::time::Instant::now();
        executor.execute(&tenant).await;
        let elapsed = start.elapsed();

        // run_timeout_max_lock_hold_ms (80ms) is shorter than
        // run_timeout_grace_ms (100ms), so the lock must be force-released
        // at timeout + max_lock_hold (50 + 80 = 130ms), not timeout + grace
        // (50 + 100 = 150ms).
        assert!(
            elapsed < Duration::from_millis(145),
            "execute() took {elapsed:?}, expected force-release bounded by max_lock_hold, well short of the grace-based 150ms"
        );
        assert!(
            elapsed >= Duration::from_millis(125),
            "execute() returned at {elapsed:?}, expected to hold the lock for at least the 130ms timeout+max_lock_hold bound"
        );

        let events = sink.events();
        assert!(events.iter().any(|e| e.event == AuditEventKind::RunMaxLockHoldReleased));
    }
}
