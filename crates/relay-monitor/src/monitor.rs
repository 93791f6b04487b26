use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use relay_core::channel::{AccountHandle, ChannelAdapter, CryptoStore, DecryptOutcome, SyncBatch};
use relay_core::config::{Config, MonitorConfig, OrchestrationConfig, RetryConfig, RouterConfig};
use relay_core::error::CoreError;
use relay_core::event::ChannelEvent;
use relay_core::run::RunConfig;
use relay_core::session::SessionKey;
use relay_router::{classify, route};
use relay_scheduler::{Scheduler, SubmitOutcome};
use resilience::run_with_retry;

use crate::access::AccessControl;
use crate::cursor::{CursorStore, SyncState};
use crate::dedup::DedupSet;
use crate::dispatch::{Job, RoomDispatcher};
use crate::ingest::session_key_for;
use crate::normalize::Normalizer;
use crate::utd::{UtdDisposition, UtdQueue};

const SYNC_ERROR_BACKOFF: Duration = Duration::from_secs(2);
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(30);
const CRYPTO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Running,
    Paused,
    Draining,
    Stopped,
}

/// The monitor → scheduler handoff. Injected via constructor so the
/// monitor never reaches for shared state, and tests can record
/// submissions without a real scheduler.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn submit(&self, key: SessionKey, prompt: String, config: RunConfig) -> SubmitOutcome;
}

#[async_trait]
impl Dispatch for Arc<Scheduler> {
    async fn submit(&self, key: SessionKey, prompt: String, config: RunConfig) -> SubmitOutcome {
        Scheduler::submit(self, key, prompt, config).await
    }
}

/// One long-poll loop per channel account: ingest crypto state, persist
/// the sync cursor, then dispatch timeline events through dedup,
/// decryption, normalization, and access control into per-room serial
/// queues.
pub struct Monitor {
    channel_id: String,
    account_id: String,
    default_agent: String,
    adapter: Arc<dyn ChannelAdapter>,
    crypto: Arc<dyn CryptoStore>,
    scheduler: Arc<dyn Dispatch>,
    router: RouterConfig,
    orchestration: OrchestrationConfig,
    monitor_config: MonitorConfig,
    retry: RetryConfig,
    access: Mutex<AccessControl>,
    state: Mutex<MonitorState>,
    cancel: CancellationToken,
    dedup: Mutex<DedupSet>,
    utd: Mutex<UtdQueue>,
    cursor: Mutex<Option<String>>,
    cursor_store: CursorStore,
    dispatcher: RoomDispatcher,
    normalizer: tokio::sync::Mutex<Normalizer>,
    join: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel_id: &str,
        account_id: &str,
        default_agent: &str,
        config: &Config,
        data_dir: &Path,
        adapter: Arc<dyn ChannelAdapter>,
        crypto: Arc<dyn CryptoStore>,
        scheduler: Arc<dyn Dispatch>,
    ) -> Arc<Self> {
        let channel_config = config.channels.get(channel_id).cloned().unwrap_or_default();
        Arc::new(Self {
            channel_id: channel_id.to_string(),
            account_id: account_id.to_string(),
            default_agent: default_agent.to_string(),
            normalizer: tokio::sync::Mutex::new(Normalizer::new(adapter.clone())),
            adapter,
            crypto,
            scheduler,
            router: config.router.clone(),
            orchestration: config.orchestration.clone(),
            monitor_config: config.monitor.clone(),
            retry: config.retry.clone(),
            access: Mutex::new(AccessControl::new(channel_config)),
            state: Mutex::new(MonitorState::Idle),
            cancel: CancellationToken::new(),
            dedup: Mutex::new(DedupSet::new(config.monitor.dedup_capacity)),
            utd: Mutex::new(UtdQueue::new(&config.monitor)),
            cursor: Mutex::new(None),
            cursor_store: CursorStore::new(data_dir, channel_id),
            dispatcher: RoomDispatcher::new(Duration::from_secs(
                config.monitor.room_idle_grace_secs,
            )),
            join: tokio::sync::Mutex::new(None),
        })
    }

    pub fn state(&self) -> MonitorState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn utd_backlog(&self) -> usize {
        self.utd.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Record a completed pairing handshake for `pairing`-policy DMs.
    pub fn pair(&self, sender_id: &str) {
        self.access
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pair(sender_id);
    }

    /// Idempotent: a second start on a live account is a no-op. This
    /// guards against hot-reload duplicates spawning a second sync loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), CoreError> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                MonitorState::Running | MonitorState::Paused | MonitorState::Draining => {
                    log::warn!(
                        "[{}] monitor already running, ignoring duplicate start",
                        self.channel_id
                    );
                    return Ok(());
                }
                MonitorState::Idle | MonitorState::Stopped => *state = MonitorState::Running,
            }
        }

        let persisted = self.cursor_store.load().await;
        *self.cursor.lock().unwrap_or_else(|e| e.into_inner()) = persisted.cursor;
        *self.dedup.lock().unwrap_or_else(|e| e.into_inner()) =
            DedupSet::from_snapshot(self.monitor_config.dedup_capacity, persisted.seen);

        let handle = match self.adapter.start_account(&self.account_id).await {
            Ok(handle) => handle,
            Err(error) => {
                self.set_state(MonitorState::Idle);
                return Err(error);
            }
        };

        log::info!("[{}] monitor started", self.channel_id);
        let monitor = self.clone();
        let join = tokio::spawn(async move { monitor.run_loop(handle).await });
        *self.join.lock().await = Some(join);
        Ok(())
    }

    /// Stop accepting sync batches, drain the per-room queues, tear down
    /// crypto, and release the account. Safe to call more than once.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(join) = self.join.lock().await.take() {
            if let Err(error) = join.await {
                if !error.is_cancelled() {
                    log::warn!("[{}] sync loop ended abnormally: {error}", self.channel_id);
                }
            }
        }
        self.set_state(MonitorState::Stopped);
    }

    async fn run_loop(self: Arc<Self>, handle: AccountHandle) {
        let poll_timeout = Duration::from_secs(self.monitor_config.poll_timeout_secs);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner()).clone();

            match self
                .adapter
                .poll(&handle, cursor.as_deref(), poll_timeout, &self.cancel)
                .await
            {
                Ok(batch) => self.process_batch(&handle, batch).await,
                Err(CoreError::Cancelled) => break,
                Err(CoreError::Unauthorized) => {
                    // Soft logout: pause, re-authenticate, resume. The
                    // crypto store is preserved across the pause.
                    log::warn!("[{}] authentication lost, pausing sync", self.channel_id);
                    self.set_state(MonitorState::Paused);
                    let reauth =
                        run_with_retry(&self.retry, None, "channel reauth", || async {
                            self.adapter.reauth(&handle).await
                        })
                        .await;
                    match reauth {
                        Ok(()) => {
                            log::info!("[{}] re-authenticated, resuming", self.channel_id);
                            self.set_state(MonitorState::Running);
                        }
                        Err(error) => {
                            log::error!(
                                "[{}] re-authentication failed, stopping: {error}",
                                self.channel_id
                            );
                            break;
                        }
                    }
                }
                Err(CoreError::RateLimited { retry_after_ms }) => {
                    let wait = Duration::from_millis(retry_after_ms.unwrap_or(1_000))
                        .min(MAX_RATE_LIMIT_WAIT);
                    log::debug!(
                        "[{}] sync rate limited, waiting {}ms",
                        self.channel_id,
                        wait.as_millis()
                    );
                    if self.sleep_or_cancel(wait).await {
                        break;
                    }
                }
                Err(error) => {
                    log::warn!("[{}] sync failed: {error}", self.channel_id);
                    if self.sleep_or_cancel(SYNC_ERROR_BACKOFF).await {
                        break;
                    }
                }
            }
        }

        self.set_state(MonitorState::Draining);
        self.dispatcher.drain().await;
        self.persist_sync_state().await;
        if let Err(error) = self.crypto.close().await {
            log::warn!("[{}] crypto close failed: {error}", self.channel_id);
        }
        if let Err(error) = self.adapter.stop_account(&handle).await {
            log::warn!("[{}] account stop failed: {error}", self.channel_id);
        }
        self.set_state(MonitorState::Stopped);
        log::info!("[{}] monitor stopped", self.channel_id);
    }

    async fn process_batch(&self, handle: &AccountHandle, batch: SyncBatch) {
        // Opaque pre-timeline state (e.g. to-device crypto events) must
        // reach the pre-processor before any timeline event dispatches.
        if !batch.pre_timeline.is_empty() {
            if let Err(error) = self.crypto.ingest_pre_timeline(&batch.pre_timeline).await {
                log::warn!("[{}] pre-timeline ingest failed: {error}", self.channel_id);
            }
        }

        // Persist the cursor (with the dedup snapshot) before dispatching:
        // a crash from here on redelivers rather than loses events.
        *self.cursor.lock().unwrap_or_else(|e| e.into_inner()) = Some(batch.next_cursor.clone());
        self.persist_sync_state().await;

        for event in batch.timeline {
            // One bad event never aborts the iteration.
            self.handle_event(handle, event).await;
        }

        self.retry_utd(handle).await;
    }

    async fn handle_event(&self, handle: &AccountHandle, event: ChannelEvent) {
        let already_seen = self
            .dedup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&event.event_id);
        if already_seen {
            log::debug!("[{}] duplicate event {}", self.channel_id, event.event_id);
            return;
        }

        let event = if event.encrypted {
            match self.decrypt_bounded(&event).await {
                Ok(DecryptOutcome::Plaintext(body)) => decrypted(event, body),
                Ok(DecryptOutcome::Undecryptable) => {
                    log::debug!(
                        "[{}] undecryptable event {}, parking for retry",
                        self.channel_id,
                        event.event_id
                    );
                    self.utd.lock().unwrap_or_else(|e| e.into_inner()).push(event);
                    return;
                }
                Err(error) => {
                    log::warn!(
                        "[{}] decrypt failed for {}: {error}",
                        self.channel_id,
                        event.event_id
                    );
                    return;
                }
            }
        } else {
            event
        };

        self.dispatch_event(handle, event).await;
    }

    /// Retry parked undecryptable events oldest-first: decrypt again
    /// within the retry window, fall back to key backup after the retry
    /// budget, drop at hard expiry.
    async fn retry_utd(&self, handle: &AccountHandle) {
        let entries = self.utd.lock().unwrap_or_else(|e| e.into_inner()).drain();
        for mut entry in entries {
            let disposition = self.utd.lock().unwrap_or_else(|e| e.into_inner()).disposition(&entry);
            match disposition {
                UtdDisposition::Expire => {
                    log::warn!(
                        "[{}] giving up on undecryptable event {} (expired)",
                        self.channel_id,
                        entry.event.event_id
                    );
                }
                UtdDisposition::Park => {
                    self.utd.lock().unwrap_or_else(|e| e.into_inner()).requeue(entry);
                }
                UtdDisposition::Retry => match self.decrypt_bounded(&entry.event).await {
                    Ok(DecryptOutcome::Plaintext(body)) => {
                        let event = decrypted(entry.event, body);
                        self.dispatch_event(handle, event).await;
                    }
                    Ok(DecryptOutcome::Undecryptable) => {
                        entry.retries += 1;
                        self.utd.lock().unwrap_or_else(|e| e.into_inner()).requeue(entry);
                    }
                    Err(error) => {
                        log::warn!(
                            "[{}] UTD retry failed for {}: {error}",
                            self.channel_id,
                            entry.event.event_id
                        );
                        entry.retries += 1;
                        self.utd.lock().unwrap_or_else(|e| e.into_inner()).requeue(entry);
                    }
                },
                UtdDisposition::KeyBackup => {
                    match self.crypto.restore_from_backup(&entry.event).await {
                        Ok(Some(body)) => {
                            let event = decrypted(entry.event, body);
                            self.dispatch_event(handle, event).await;
                        }
                        Ok(None) => {
                            log::warn!(
                                "[{}] key backup had nothing for {}, dropping",
                                self.channel_id,
                                entry.event.event_id
                            );
                        }
                        Err(error) => {
                            log::warn!(
                                "[{}] key backup lookup failed for {}: {error}",
                                self.channel_id,
                                entry.event.event_id
                            );
                        }
                    }
                }
            }
        }
    }

    async fn dispatch_event(&self, handle: &AccountHandle, event: ChannelEvent) {
        let normalized = self.normalizer.lock().await.normalize(handle, event).await;
        let Some(message) = normalized else {
            return;
        };

        let allowed = self
            .access
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .allows(&message.event);
        if !allowed {
            // Disallowed senders are dropped silently.
            log::debug!(
                "[{}] sender {} not allowed, dropping {}",
                self.channel_id,
                message.event.sender_id,
                message.event.event_id
            );
            return;
        }

        self.dedup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(&message.event.event_id);

        let classification = classify(&message.body, &self.router, &self.orchestration);
        let decision = route(&classification, &message.body, &self.router);

        let agent_id = decision
            .primary_agent
            .clone()
            .filter(|_| decision.should_delegate)
            .unwrap_or_else(|| self.default_agent.clone());
        let prompt = decision
            .primary_prompt
            .clone()
            .filter(|_| decision.should_delegate)
            .unwrap_or_else(|| message.body.clone());
        let key = session_key_for(&agent_id, &message.event);
        let background = decision
            .background_agent
            .clone()
            .zip(decision.background_prompt.clone())
            .filter(|_| decision.should_delegate);

        let scheduler = self.scheduler.clone();
        let channel_id = self.channel_id.clone();
        let room_id = message.event.room_id.clone();
        let bg_event = message.event.clone();

        let job: Job = Box::pin(async move {
            let outcome = scheduler
                .submit(
                    key.clone(),
                    prompt,
                    RunConfig {
                        agent_id: key.agent_id().to_string(),
                        ..Default::default()
                    },
                )
                .await;
            log::debug!("[{channel_id}] dispatched {key}: {outcome:?}");

            if let Some((bg_agent, bg_prompt)) = background {
                let bg_key = session_key_for(&bg_agent, &bg_event);
                let outcome = scheduler
                    .submit(
                        bg_key.clone(),
                        bg_prompt,
                        RunConfig {
                            agent_id: bg_agent,
                            ..Default::default()
                        },
                    )
                    .await;
                log::debug!("[{channel_id}] background dispatch {bg_key}: {outcome:?}");
            }
        });

        self.dispatcher.dispatch(&room_id, job).await;
    }

    /// Crypto calls get their own bound so a wedged FFI layer cannot
    /// stall the sync loop.
    async fn decrypt_bounded(&self, event: &ChannelEvent) -> Result<DecryptOutcome, CoreError> {
        match tokio::time::timeout(CRYPTO_TIMEOUT, self.crypto.decrypt(event)).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::TransientNetwork(format!(
                "decrypt of {} timed out after {}s",
                event.event_id,
                CRYPTO_TIMEOUT.as_secs()
            ))),
        }
    }

    async fn persist_sync_state(&self) {
        let state = SyncState {
            cursor: self.cursor.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            seen: self
                .dedup
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .snapshot(),
        };
        if let Err(error) = self.cursor_store.save(&state).await {
            log::warn!("[{}] failed to persist sync state: {error}", self.channel_id);
        }
    }

    /// Returns true when cancelled during the sleep.
    async fn sleep_or_cancel(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.cancel.cancelled() => true,
        }
    }

    fn set_state(&self, state: MonitorState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

fn decrypted(mut event: ChannelEvent, body: String) -> ChannelEvent {
    event.body = body;
    event.encrypted = false;
    event
}
