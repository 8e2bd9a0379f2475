use tokio_util::sync::CancellationToken;

use crate::ids::{RunId, TenantId};

/// Created per run, destroyed on settlement. Handed to `RunProvider::run_once`
/// so the provider can observe both its identity and the executor's
/// cancellation signal.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub cancellation: CancellationToken,
}

impl RunContext {
    pub fn new(tenant_id: TenantId, run_id: RunId) -> Self {
        Self {
            tenant_id,
            run_id,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
