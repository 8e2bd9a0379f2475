//! The `RunProvider` contract: the single capability the agent runtime
//! consumes from everything it drives. The runtime does not know what a
//! provider does internally (memory, world model, goal stack, planner,
//! tool sandbox, LLM adapter — all out of scope here); it only invokes
//! `run_once` under its own timeout/cancellation/bookkeeping rules.

use async_trait::async_trait;
use tandem_types::{RunContext, RunOutcome};

/// One tenant's agent "run" function. May suspend indefinitely, may return
/// an error, and may ignore the cancellation token on `ctx` — the runtime
/// is built to tolerate all three (see `tandem-orchestrator`'s executor).
#[async_trait]
pub trait RunProvider: Send + Sync {
    async fn run_once(&self, ctx: &RunContext) -> anyhow::Result<RunOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_types::{RunId, RunStatus, TenantId};

    struct EchoProvider;

    #[async_trait]
    impl RunProvider for EchoProvider {
        async fn run_once(&self, _ctx: &RunContext) -> anyhow::Result<RunOutcome> {
            Ok(RunOutcome::completed(10))
        }
    }

    #[tokio::test]
    async fn provider_trait_is_object_safe_and_callable() {
        let provider: Box<dyn RunProvider> = Box::new(EchoProvider);
        let ctx = RunContext::new(TenantId::new("t1"), RunId::new("r1"));
        let outcome = provider.run_once(&ctx).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.tokens_used(), 10);
    }
}
