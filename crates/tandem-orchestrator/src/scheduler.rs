use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tandem_types::{Clock, TenantId};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use crate::audit::AuditSink;
use crate::config::{ConfigInvalid, RuntimeConfig};
use crate::executor::RunExecutor;
use crate::ids::{DefaultRunIdGenerator, RunIdGenerator};
use crate::store::TenantStore;
use tandem_providers::RunProvider;

/// Injectable periodic timer. Implementations own the timer
/// state between calls so the period is not skewed by however long the
/// scheduler itself takes to react to a tick.
#[async_trait]
pub trait TickSource: Send + Sync {
    async fn next_tick(&self, interval_ms: u64);
}

/// Default `TickSource`: wraps `tokio::time::interval`, started one period
/// in the future rather than firing immediately, so `heartbeatIntervalMs=N`
/// means "every N ms starting at N".
/// Lazily constructed on first use so construction doesn't require an
/// active Tokio runtime.
#[derive(Default)]
pub struct TokioTicker {
    interval: AsyncMutex<Option<tokio::time::Interval>>,
}

impl TokioTicker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TickSource for TokioTicker {
    async fn next_tick(&self, interval_ms: u64) {
        let mut guard = self.interval.lock().await;
        let interval = guard.get_or_insert_with(|| {
            let period = std::time::Duration::from_millis(interval_ms);
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });
        interval.tick().await;
    }
}

/// Bounded, per-tenant-coalescing event queue. Backed by a plain
/// `VecDeque` rather than a channel: a bounded `mpsc` can express "reject
/// when full" but not "drop the oldest entry to admit the newest", which is
/// the discipline this queue needs.
struct EventQueue {
    max_size: usize,
    items: StdMutex<VecDeque<TenantId>>,
    notify: Notify,
}

impl EventQueue {
    fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            items: StdMutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Per-tenant coalescing (newest wins) followed by drop-head backpressure
    /// once the queue is at capacity.
    fn push(&self, tenant_id: TenantId) {
        let mut items = self.items.lock().expect("event queue mutex poisoned");
        items.retain(|t| t != &tenant_id);
        items.push_back(tenant_id);
        while items.len() > self.max_size {
            items.pop_front();
        }
        drop(items);
        self.notify.notify_one();
    }

    /// Blocks until an entry is available. Safe against the
    /// check-then-wait race: `Notify` stores a permit for any `notify_one`
    /// that happens before this future is polled, regardless of when the
    /// future object itself was created.
    async fn pop(&self) -> TenantId {
        loop {
            let notified = self.notify.notified();
            if let Some(tenant_id) = self.items.lock().expect("event queue mutex poisoned").pop_front() {
                return tenant_id;
            }
            notified.await;
        }
    }

    fn clear(&self) {
        self.items.lock().expect("event queue mutex poisoned").clear();
    }

    fn len(&self) -> usize {
        self.items.lock().expect("event queue mutex poisoned").len()
    }
}

#[derive(Default)]
struct SchedulerState {
    running: bool,
    heartbeat_tenants: HashSet<TenantId>,
    /// Coalescing counter: a tenant present here has a
    /// heartbeat-originated run dispatched but not yet settled, so further
    /// ticks for it are dropped rather than queued.
    heartbeat_pending: HashSet<TenantId>,
    heartbeat_task: Option<JoinHandle<()>>,
    queue_task: Option<JoinHandle<()>>,
}

struct SchedulerInner {
    config: Arc<RuntimeConfig>,
    executor: Arc<RunExecutor>,
    tick_source: Arc<dyn TickSource>,
    queue: EventQueue,
    state: StdMutex<SchedulerState>,
    /// Per-tenant FIFO exclusion across heartbeat and event origins
    /// independent of the executor's own provider-invocation
    /// lock: this serializes whole `execute()` calls (including the
    /// budget/circuit checks that precede the provider lock), not just the
    /// provider invocation itself.
    dispatch_locks: StdMutex<HashMap<TenantId, Arc<AsyncMutex<()>>>>,
}

/// Drives the run executor via two trigger sources: a periodic
/// heartbeat over a configured set of tenants, and an `emit_event` queue for
/// on-demand runs. Cheaply cloneable; clones share the same underlying
/// scheduler state and background tasks.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Wires up a `Scheduler` with the default `TracingAuditSink`,
    /// `DefaultRunIdGenerator`, system clock, and `TokioTicker`. Fails fast
    /// with `ConfigInvalid`.
    pub fn new(config: RuntimeConfig, provider: Arc<dyn RunProvider>) -> Result<Self, ConfigInvalid> {
        Self::with_dependencies(
            config,
            provider,
            Arc::new(crate::audit::TracingAuditSink),
            Arc::new(DefaultRunIdGenerator::new()),
            Arc::new(tandem_types::SystemClock),
            Arc::new(TokioTicker::new()),
        )
    }

    pub fn with_dependencies(
        config: RuntimeConfig,
        provider: Arc<dyn RunProvider>,
        audit_sink: Arc<dyn AuditSink>,
        run_ids: Arc<dyn RunIdGenerator>,
        clock: Arc<dyn Clock>,
        tick_source: Arc<dyn TickSource>,
    ) -> Result<Self, ConfigInvalid> {
        config.validate()?;
        let config = Arc::new(config);
        let store = Arc::new(TenantStore::new(config.tenant_idle_eviction_ms));
        let executor = Arc::new(RunExecutor::new(
            store,
            config.clone(),
            provider,
            audit_sink,
            run_ids,
            clock,
        ));
        let queue = EventQueue::new(config.max_event_queue_size);

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                config,
                executor,
                tick_source,
                queue,
                state: StdMutex::new(SchedulerState::default()),
                dispatch_locks: StdMutex::new(HashMap::new()),
            }),
        })
    }

    /// Idempotent: a tenant already registered, or a runtime already
    /// started, is a no-op beyond adding `tenant_id` to the heartbeat set.
    pub fn start(&self, tenant_id: TenantId) {
        let mut state = self.inner.state.lock().expect("scheduler state mutex poisoned");
        state.heartbeat_tenants.insert(tenant_id);
        if state.running {
            return;
        }
        state.running = true;

        let heartbeat_inner = self.inner.clone();
        state.heartbeat_task = Some(tokio::spawn(heartbeat_loop(heartbeat_inner)));

        let queue_inner = self.inner.clone();
        state.queue_task = Some(tokio::spawn(queue_loop(queue_inner)));
    }

    /// Clears the heartbeat timer and the event queue; does not
    /// cancel already-dispatched provider calls, which settle under the
    /// same timeout/grace rules regardless.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock().expect("scheduler state mutex poisoned");
        state.running = false;
        state.heartbeat_tenants.clear();
        if let Some(task) = state.heartbeat_task.take() {
            task.abort();
        }
        if let Some(task) = state.queue_task.take() {
            task.abort();
        }
        drop(state);
        self.inner.queue.clear();
    }

    /// No-op when stopped.
    pub fn emit_event(&self, tenant_id: TenantId) {
        if !self.inner.state.lock().expect("scheduler state mutex poisoned").running {
            return;
        }
        self.inner.queue.push(tenant_id);
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().expect("scheduler state mutex poisoned").running
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }
}

async fn heartbeat_loop(inner: Arc<SchedulerInner>) {
    let interval_ms = inner.config.heartbeat_interval_ms;
    loop {
        inner.tick_source.next_tick(interval_ms).await;

        let tenants: Vec<TenantId> = {
            let state = inner.state.lock().expect("scheduler state mutex poisoned");
            state.heartbeat_tenants.iter().cloned().collect()
        };

        for tenant_id in tenants {
            let should_dispatch = {
                let mut state = inner.state.lock().expect("scheduler state mutex poisoned");
                if state.heartbeat_pending.contains(&tenant_id) {
                    false
                } else {
                    state.heartbeat_pending.insert(tenant_id.clone());
                    true
                }
            };
            if !should_dispatch {
                // Coalesced: a heartbeat-originated run for this tenant is
                // already pending, so this tick is dropped.
                continue;
            }

            let dispatch_inner = inner.clone();
            let dispatch_tenant = tenant_id.clone();
            tokio::spawn(async move {
                dispatch(&dispatch_inner, dispatch_tenant.clone()).await;
                dispatch_inner
                    .state
                    .lock()
                    .expect("scheduler state mutex poisoned")
                    .heartbeat_pending
                    .remove(&dispatch_tenant);
            });
        }
    }
}

async fn queue_loop(inner: Arc<SchedulerInner>) {
    loop {
        let tenant_id = inner.queue.pop().await;
        // Single consumer: the next dequeue is blocked until this
        // run has settled and been audited.
        dispatch(&inner, tenant_id).await;
    }
}

async fn dispatch(inner: &Arc<SchedulerInner>, tenant_id: TenantId) {
    let lock = {
        let mut locks = inner.dispatch_locks.lock().expect("dispatch lock map mutex poisoned");
        locks
            .entry(tenant_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    };
    let _guard = lock.lock().await;
    inner.executor.execute(&tenant_id).await;
}
