pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod llm;
pub mod message;
pub mod run;
pub mod session;
pub mod tools;

pub use channel::{
    AccountHandle, ChannelAdapter, CryptoStore, DecryptOutcome, OutboundTarget, SendOpts,
    SyncBatch,
};
pub use config::{
    AgentDefaults, BreakerConfig, ChannelConfig, Config, DelegationMode, DmPolicy, GroupPolicy,
    IntentConfig, MonitorConfig, OrchestrationConfig, OutputMode, QueueMode, RateLimitConfig,
    RetryConfig, RouterConfig, SchedulerConfig,
};
pub use error::{CoreError, TimeoutPhase};
pub use event::{
    ChannelEvent, LifecycleEvent, LifecycleSender, MediaAttachment, NoopObserver, RunObserver,
};
pub use llm::{LlmClient, LlmRequest, LlmStream, StreamEvent, TokenUsage};
pub use message::{Message, Role};
pub use run::{AgentRun, BlockerInfo, BlockerReason, RunConfig, RunStatus};
pub use session::{ParseSessionKeyError, SessionEntry, SessionKey, ThinkingLevel};
pub use tools::{ToolCall, ToolExecutor, ToolResult, ToolSchema};
