use std::sync::Mutex;

use async_trait::async_trait;
use futures::FutureExt;
use tandem_types::AuditEvent;

/// Best-effort event emitter. The executor `.await`s this but must
/// never let a panicking or erroring sink implementation unwind into or
/// reorder the run path.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_runtime_event(&self, event: AuditEvent);
}

/// Default sink: forwards to `tandem-observability`'s structured tracing
/// events. The durable/consumer-facing channel and the operational one read
/// from the same `AuditEvent` value so they never drift.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log_runtime_event(&self, event: AuditEvent) {
        tandem_observability::emit_audit_event(&event);
    }
}

/// In-memory sink for assertions in scheduler/executor tests.
#[derive(Default)]
pub struct VecAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl VecAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit sink mutex poisoned").clone()
    }

    pub fn count(&self, kind: tandem_types::AuditEventKind) -> usize {
        self.events()
            .iter()
            .filter(|e| std::mem::discriminant(&e.event) == std::mem::discriminant(&kind))
            .count()
    }
}

#[async_trait]
impl AuditSink for VecAuditSink {
    async fn log_runtime_event(&self, event: AuditEvent) {
        self.events.lock().expect("audit sink mutex poisoned").push(event);
    }
}

/// Runs `sink.log_runtime_event` through a detached task so a sink that
/// panics cannot unwind into the run path; a rejection/panic is logged and
/// dropped.
pub async fn emit(sink: &(dyn AuditSink), event: AuditEvent) {
    // The sink is borrowed for the duration of the call rather than spawned
    // onto a new task (sinks are `Send + Sync` but not necessarily `'static`
    // from every call site); `AssertUnwindSafe` plus `catch_unwind` gives the
    // same "never propagate, never reorder" guarantee without that
    // constraint, since everything here still runs synchronously-in-order
    // on the calling task before the executor proceeds to the next step.
    let result = std::panic::AssertUnwindSafe(sink.log_runtime_event(event))
        .catch_unwind()
        .await;
    if result.is_err() {
        tracing::warn!("audit sink panicked; event suppressed");
    }
}
