use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::OutputMode;
use crate::session::{SessionKey, ThinkingLevel};

const RECENT_ACTION_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Starting,
    Running,
    WaitingForInput,
    Idle,
    Blocked,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    /// Terminal states free the session for the next queued message.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Idle | RunStatus::Completed | RunStatus::Cancelled | RunStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerReason {
    InsufficientFunds,
    RateLimit,
    ApiKeyError,
    PermissionDenied,
    ConnectionError,
}

impl std::fmt::Display for BlockerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BlockerReason::InsufficientFunds => "insufficient_funds",
            BlockerReason::RateLimit => "rate_limit",
            BlockerReason::ApiKeyError => "api_key_error",
            BlockerReason::PermissionDenied => "permission_denied",
            BlockerReason::ConnectionError => "connection_error",
        };
        f.write_str(name)
    }
}

/// Emitted when an assistant message matches a blocker pattern. The run
/// halts and waits for operator attention instead of retrying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockerInfo {
    pub reason: BlockerReason,
    pub matched_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_context: Option<serde_json::Value>,
}

/// Per-run settings resolved by the scheduler before the worker starts.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub agent_id: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub thinking_level: Option<ThinkingLevel>,
    pub output_mode: Option<OutputMode>,
    /// Caller-supplied wall-clock bound for the whole run.
    pub timeout: Option<Duration>,
}

/// In-memory state of one end-to-end streaming call. `run_id` is never
/// reused; the object is dropped after the stream terminates and pending
/// tool results are flushed.
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub run_id: String,
    pub session_key: SessionKey,
    pub prompt: String,
    pub config: RunConfig,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
    pub event_count: u64,
    recent_actions: VecDeque<String>,
    pub current_question: Option<String>,
    pub blocker_info: Option<BlockerInfo>,
}

impl AgentRun {
    pub fn new(session_key: SessionKey, prompt: impl Into<String>, config: RunConfig) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            session_key,
            prompt: prompt.into(),
            config,
            started_at: Utc::now(),
            status: RunStatus::Starting,
            event_count: 0,
            recent_actions: VecDeque::with_capacity(RECENT_ACTION_CAPACITY),
            current_question: None,
            blocker_info: None,
        }
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
    }

    pub fn record_event(&mut self) {
        self.event_count += 1;
    }

    pub fn record_action(&mut self, action: impl Into<String>) {
        if self.recent_actions.len() == RECENT_ACTION_CAPACITY {
            self.recent_actions.pop_front();
        }
        self.recent_actions.push_back(action.into());
    }

    pub fn recent_actions(&self) -> impl Iterator<Item = &str> {
        self.recent_actions.iter().map(String::as_str)
    }
}
