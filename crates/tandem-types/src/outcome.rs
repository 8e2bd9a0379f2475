use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminal status reported by a `RunProvider` for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Idle,
    Error,
    DryRun,
}

/// What a provider hands back after `run_once` settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl RunOutcome {
    pub fn completed(tokens_used: u64) -> Self {
        Self {
            status: RunStatus::Completed,
            tokens_used: Some(tokens_used),
            payload: None,
        }
    }

    pub fn error() -> Self {
        Self {
            status: RunStatus::Error,
            tokens_used: None,
            payload: None,
        }
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used.unwrap_or(0)
    }
}
