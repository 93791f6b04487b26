use serde::{Deserialize, Serialize};

use crate::run::{BlockerInfo, RunStatus};
use crate::session::SessionKey;
use crate::tools::ToolResult;

/// Inbound datum from a chat adapter, already shaped enough to resolve a
/// session key after normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEvent {
    pub channel_id: String,
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub event_id: String,
    pub sender_id: String,
    pub body: String,
    #[serde(default)]
    pub media: Vec<MediaAttachment>,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub is_own_message: bool,
    #[serde(default)]
    pub encrypted: bool,
    /// Direct-message room vs. group room; decides which access policy
    /// applies and the session scope.
    #[serde(default)]
    pub is_direct: bool,
    /// Notice-style bot messages are dropped during normalization.
    #[serde(default)]
    pub is_notice: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Side-channel notifications for external observers. Delivery is
/// best-effort; the core never depends on it for correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    SessionStart {
        session_key: SessionKey,
    },
    SessionReset {
        session_key: SessionKey,
        reason: String,
    },
    SessionCompacted {
        session_key: SessionKey,
        count: u32,
    },
    AgentReply {
        session_key: SessionKey,
        run_id: String,
        turn_id: String,
        input: String,
        output: String,
    },
    RunBlocked {
        session_key: SessionKey,
        run_id: String,
        blocker: BlockerInfo,
    },
}

pub type LifecycleSender = tokio::sync::broadcast::Sender<LifecycleEvent>;

/// Typed capability replacing per-callback plumbing: the scheduler accepts
/// one observer per run and forwards every noteworthy moment through it.
pub trait RunObserver: Send + Sync {
    fn on_state_change(&self, run_id: &str, status: RunStatus);
    fn on_tool_result(&self, run_id: &str, result: &ToolResult);
    fn on_blocker(&self, run_id: &str, blocker: &BlockerInfo);
    fn on_question(&self, run_id: &str, question: &str);
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {
    fn on_state_change(&self, _run_id: &str, _status: RunStatus) {}
    fn on_tool_result(&self, _run_id: &str, _result: &ToolResult) {}
    fn on_blocker(&self, _run_id: &str, _blocker: &BlockerInfo) {}
    fn on_question(&self, _run_id: &str, _question: &str) {}
}
