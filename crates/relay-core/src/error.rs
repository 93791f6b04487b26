use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::run::BlockerInfo;

/// Which phase of a run a timeout was observed in. The phase is read from
/// the coordinator's snapshot at expiry and decides whether the error is
/// retryable, surfaced as a synthetic tool result, or triggers a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPhase {
    ModelCall,
    ToolExecution,
    Compaction,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutPhase::ModelCall => write!(f, "model_call"),
            TimeoutPhase::ToolExecution => write!(f, "tool_execution"),
            TimeoutPhase::Compaction => write!(f, "compaction"),
        }
    }
}

/// The gateway error taxonomy. Classification happens at the adapter
/// boundary; everything downstream matches on variants, never on message
/// strings.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("rate limited")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("timed out during {phase}")]
    Timeout { phase: TimeoutPhase },

    #[error("role ordering conflict in transcript")]
    RoleOrderingConflict,

    #[error("compaction failed: {0}")]
    CompactionFailed(String),

    #[error("model context exhausted")]
    InsufficientContext,

    #[error("run blocked: {}", .0.reason)]
    BlockerDetected(BlockerInfo),

    #[error("plan exhausted after {cycles} tool cycles")]
    PlanExhausted { cycles: u32 },

    #[error("unauthorized")]
    Unauthorized,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Fatal(String),
}

impl CoreError {
    /// Whether the retry driver may re-attempt the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::TransientNetwork(_)
                | CoreError::RateLimited { .. }
                | CoreError::Timeout {
                    phase: TimeoutPhase::ModelCall
                }
        )
    }

    /// A provider-supplied backoff hint, when the error surface carried one.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            CoreError::RateLimited { retry_after_ms } => *retry_after_ms,
            _ => None,
        }
    }

    /// Whether a failed compaction (or equivalent) should reset the session
    /// and replay the original prompt once.
    pub fn triggers_session_reset(&self) -> bool {
        matches!(
            self,
            CoreError::RoleOrderingConflict
                | CoreError::CompactionFailed(_)
                | CoreError::Timeout {
                    phase: TimeoutPhase::Compaction
                }
        )
    }
}
