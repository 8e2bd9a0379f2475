use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Global enable/disable flag that suppresses all runs regardless of trigger
/// source. Shared by reference: every clone observes the latest write, with
/// no stronger consistency required (readers only need the state current at
/// run-start time).
#[derive(Clone)]
pub struct KillSwitch(Arc<AtomicBool>);

impl KillSwitch {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn enable(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new(false)
    }
}
