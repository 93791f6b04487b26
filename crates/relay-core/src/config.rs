use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::session::ThinkingLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    #[default]
    Open,
    Allowlist,
    Pairing,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    #[default]
    Open,
    Allowlist,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    #[default]
    Enqueue,
    Steer,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    Line,
    Paragraph,
    #[default]
    MessageEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegationMode {
    Blocking,
    Background,
    #[default]
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_capacity")]
    pub capacity: u64,
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
}

fn default_rate_capacity() -> u64 {
    5
}

fn default_refill_per_sec() -> f64 {
    1.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_rate_capacity(),
            refill_per_sec: default_refill_per_sec(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub policy: DmPolicy,
    #[serde(default)]
    pub group_policy: GroupPolicy,
    #[serde(default)]
    pub allow_from: Vec<String>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefaults {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub thinking_level: ThinkingLevel,
    #[serde(default = "default_context_tokens")]
    pub context_tokens: u32,
}

fn default_provider() -> String {
    "anthropic".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4".to_string()
}

fn default_context_tokens() -> u32 {
    200_000
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            thinking_level: ThinkingLevel::default(),
            context_tokens: default_context_tokens(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub defaults: AgentDefaults,
    /// Per-agent model overrides, keyed by agent id.
    #[serde(default)]
    pub models: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_attempts() -> u32 {
    3
}

fn default_min_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    3
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
        }
    }
}

/// One routed intent: keywords that select it, the agents it delegates to,
/// and the prompt template (`{input}` substitution only).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntentConfig {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub primary: Option<String>,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub mode: DelegationMode,
}

/// Intents iterate in name order (BTreeMap), which fixes the tie-break
/// order for equal scores across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub intents: BTreeMap<String, IntentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

fn default_true() -> bool {
    true
}

fn default_confidence_threshold() -> f64 {
    0.6
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_utd_capacity")]
    pub utd_capacity: usize,
    #[serde(default = "default_utd_retry_window_secs")]
    pub utd_retry_window_secs: u64,
    #[serde(default = "default_utd_expiry_secs")]
    pub utd_expiry_secs: u64,
    #[serde(default = "default_utd_max_retries")]
    pub utd_max_retries: u32,
    #[serde(default = "default_room_idle_grace_secs")]
    pub room_idle_grace_secs: u64,
}

fn default_poll_timeout_secs() -> u64 {
    30
}

fn default_dedup_capacity() -> usize {
    1_000
}

fn default_utd_capacity() -> usize {
    200
}

fn default_utd_retry_window_secs() -> u64 {
    300
}

fn default_utd_expiry_secs() -> u64 {
    3_600
}

fn default_utd_max_retries() -> u32 {
    2
}

fn default_room_idle_grace_secs() -> u64 {
    60
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_timeout_secs: default_poll_timeout_secs(),
            dedup_capacity: default_dedup_capacity(),
            utd_capacity: default_utd_capacity(),
            utd_retry_window_secs: default_utd_retry_window_secs(),
            utd_expiry_secs: default_utd_expiry_secs(),
            utd_max_retries: default_utd_max_retries(),
            room_idle_grace_secs: default_room_idle_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub queue_mode: QueueMode,
    #[serde(default)]
    pub output_mode: OutputMode,
    #[serde(default = "default_max_plan_retries")]
    pub max_plan_retries: u32,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_max_plan_retries() -> u32 {
    4
}

fn default_tool_timeout_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_mode: QueueMode::default(),
            output_mode: OutputMode::default(),
            max_plan_retries: default_max_plan_retries(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// The whole configuration surface consumed by the core. Loaded from a
/// TOML or JSON document; environment overrides are applied last.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn parse_bool_env(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::ConfigInvalid(format!("{}: {e}", path.display())))?;
        let mut config = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            Self::from_json_str(&content)?
        } else {
            Self::from_toml_str(&content)?
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, CoreError> {
        toml::from_str(content).map_err(|e| CoreError::ConfigInvalid(e.to_string()))
    }

    pub fn from_json_str(content: &str) -> Result<Self, CoreError> {
        serde_json::from_str(content).map_err(|e| CoreError::ConfigInvalid(e.to_string()))
    }

    /// `ORCHESTRATION=false` forces the router to return a no-op decision
    /// for every input.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("ORCHESTRATION") {
            self.orchestration.enabled = parse_bool_env(&value);
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(CoreError::ConfigInvalid(format!(
                "retry.jitter must be within [0, 1], got {}",
                self.retry.jitter
            )));
        }
        if self.retry.min_delay_ms > self.retry.max_delay_ms {
            return Err(CoreError::ConfigInvalid(
                "retry.min_delay_ms exceeds retry.max_delay_ms".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(CoreError::ConfigInvalid(
                "breaker thresholds must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.orchestration.confidence_threshold) {
            return Err(CoreError::ConfigInvalid(format!(
                "orchestration.confidence_threshold must be within [0, 1], got {}",
                self.orchestration.confidence_threshold
            )));
        }
        for (name, channel) in &self.channels {
            if channel.rate_limit.refill_per_sec <= 0.0 {
                return Err(CoreError::ConfigInvalid(format!(
                    "channels.{name}.rate_limit.refill_per_sec must be positive"
                )));
            }
            if channel.rate_limit.capacity == 0 {
                return Err(CoreError::ConfigInvalid(format!(
                    "channels.{name}.rate_limit.capacity must be positive"
                )));
            }
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".relay")
        })
    }
}
