use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::event::{ChannelEvent, MediaAttachment};

/// Opaque handle for one started channel account.
#[derive(Debug, Clone)]
pub struct AccountHandle {
    pub account_id: String,
}

/// One long-poll / stream batch from the adapter. `pre_timeline` carries
/// opaque state (e.g. to-device crypto events) that must reach the
/// pre-processor before any timeline event is dispatched.
#[derive(Debug, Default)]
pub struct SyncBatch {
    pub next_cursor: String,
    pub pre_timeline: Vec<serde_json::Value>,
    pub timeline: Vec<ChannelEvent>,
}

#[derive(Debug, Clone)]
pub struct OutboundTarget {
    pub channel_id: String,
    pub room_id: String,
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SendOpts {
    pub reply_to: Option<String>,
    pub notice: bool,
}

/// The consumed channel surface. The core never constructs wire bytes; the
/// adapter owns the socket and surfaces typed errors (`RateLimited` with
/// the Retry-After hint, `Unauthorized` on auth loss).
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    async fn start_account(&self, account_id: &str) -> Result<AccountHandle, CoreError>;

    async fn stop_account(&self, handle: &AccountHandle) -> Result<(), CoreError>;

    async fn poll(
        &self,
        handle: &AccountHandle,
        cursor: Option<&str>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SyncBatch, CoreError>;

    async fn send_text(
        &self,
        target: &OutboundTarget,
        text: &str,
        opts: &SendOpts,
    ) -> Result<String, CoreError>;

    async fn send_media(
        &self,
        target: &OutboundTarget,
        media: &MediaAttachment,
        opts: &SendOpts,
    ) -> Result<String, CoreError>;

    async fn reauth(&self, handle: &AccountHandle) -> Result<(), CoreError>;

    /// Profile lookup used by normalization when the display-name cache
    /// misses. `None` falls back to the raw sender id.
    async fn display_name(
        &self,
        handle: &AccountHandle,
        user_id: &str,
    ) -> Result<Option<String>, CoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptOutcome {
    Plaintext(String),
    /// The local key store cannot open this payload yet; the monitor parks
    /// the event on the UTD retry queue.
    Undecryptable,
}

/// The consumed crypto surface. Single-writer: access is funneled through
/// one monitor worker per account.
#[async_trait]
pub trait CryptoStore: Send + Sync {
    async fn ingest_pre_timeline(&self, items: &[serde_json::Value]) -> Result<(), CoreError>;

    async fn decrypt(&self, event: &ChannelEvent) -> Result<DecryptOutcome, CoreError>;

    /// Key-backup fallback consulted after repeated UTD retries.
    async fn restore_from_backup(&self, event: &ChannelEvent)
        -> Result<Option<String>, CoreError>;

    /// Idempotent; the monitor calls it once per drain and again on close.
    async fn close(&self) -> Result<(), CoreError>;
}
