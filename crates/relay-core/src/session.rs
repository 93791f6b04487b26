use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::llm::TokenUsage;
use crate::run::BlockerInfo;

/// The unit of serialization: two dispatches sharing a session key never
/// execute in parallel. Format: `agent:<agentId>:<scope>:<conversationId>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

#[derive(Error, Debug)]
#[error("not a session key: {0}")]
pub struct ParseSessionKeyError(String);

impl SessionKey {
    pub fn new(agent_id: &str, scope: &str, conversation_id: &str) -> Self {
        Self(format!("agent:{agent_id}:{scope}:{conversation_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn agent_id(&self) -> &str {
        self.segment(1)
    }

    pub fn scope(&self) -> &str {
        self.segment(2)
    }

    pub fn conversation_id(&self) -> &str {
        self.segment(3)
    }

    fn segment(&self, index: usize) -> &str {
        self.0.splitn(4, ':').nth(index).unwrap_or_default()
    }
}

impl FromStr for SessionKey {
    type Err = ParseSessionKeyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.splitn(4, ':').collect();
        if parts.len() != 4 || parts[0] != "agent" || parts[1..].iter().any(|p| p.is_empty()) {
            return Err(ParseSessionKeyError(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Low,
    Medium,
    High,
}

/// Persisted per-session record. Treated as a value type: every mutation
/// goes through the store's `upsert` and produces a new entry (the per-key
/// write lock serializes concurrent upserts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    /// Identifies the underlying LLM conversation transcript.
    pub session_id: String,
    /// Handle used by the LLM client to resume the transcript.
    pub session_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub thinking_level: ThinkingLevel,
    pub context_tokens: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub system_sent: bool,
    #[serde(default)]
    pub aborted_last_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker_info: Option<BlockerInfo>,
    #[serde(default)]
    pub compaction_count: u32,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl SessionEntry {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        thinking_level: ThinkingLevel,
        context_tokens: u32,
        transcript_dir: &Path,
    ) -> Self {
        let session_id = Uuid::new_v4().to_string();
        let session_file = transcript_dir.join(format!("{session_id}.jsonl"));
        Self {
            session_id,
            session_file,
            resume_token: None,
            provider: provider.into(),
            model: model.into(),
            thinking_level,
            context_tokens,
            updated_at: Utc::now(),
            system_sent: false,
            aborted_last_run: false,
            blocker_info: None,
            compaction_count: 0,
            usage: TokenUsage::default(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Allocate a fresh transcript, clearing per-transcript state. Returns
    /// the path of the old transcript so the caller can delete it best-effort
    /// before the new entry commits.
    pub fn reset(&mut self, transcript_dir: &Path) -> PathBuf {
        let old_file = std::mem::replace(&mut self.session_file, PathBuf::new());
        self.session_id = Uuid::new_v4().to_string();
        self.session_file = transcript_dir.join(format!("{}.jsonl", self.session_id));
        self.resume_token = None;
        self.system_sent = false;
        self.aborted_last_run = false;
        self.blocker_info = None;
        self.compaction_count = 0;
        self.touch();
        old_file
    }

    pub fn record_usage(&mut self, usage: &TokenUsage) {
        self.usage.prompt_tokens += usage.prompt_tokens;
        self.usage.completion_tokens += usage.completion_tokens;
        self.usage.total_tokens += usage.total_tokens;
        self.touch();
    }
}
