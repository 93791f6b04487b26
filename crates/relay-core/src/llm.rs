use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::message::Message;
use crate::session::ThinkingLevel;
use crate::tools::ToolSchema;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// One event from the provider's streaming surface.
#[derive(Debug)]
pub enum StreamEvent {
    AssistantText {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        id: String,
        output: String,
        is_error: bool,
    },
    End {
        usage: TokenUsage,
    },
    /// Already classified by the provider adapter; the coordinator never
    /// inspects message strings.
    Error {
        error: CoreError,
    },
}

pub type LlmStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub system_prompt: String,
    pub provider: String,
    pub model: String,
    pub thinking_level: ThinkingLevel,
    /// Transcript handle for resume, when the provider supports it.
    pub session_file: Option<PathBuf>,
    pub resume_token: Option<String>,
}

/// The consumed LLM surface. Adapters translate provider wire formats into
/// `StreamEvent`s; the core never builds request bytes itself.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn stream(
        &self,
        request: LlmRequest,
        cancel: CancellationToken,
    ) -> Result<LlmStream, CoreError>;

    /// The compaction pass: summarize a transcript so it fits the context
    /// budget again.
    async fn summarize(&self, messages: &[Message]) -> Result<String, CoreError>;
}
