use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use relay_core::config::QueueMode;
use relay_core::event::RunObserver;
use relay_core::run::{AgentRun, BlockerInfo, RunConfig, RunStatus};
use relay_core::session::SessionKey;
use relay_loop::{OutputSink, PhaseCell, RunPhase};

use crate::context::CoreContext;
use crate::runner;

/// Maps a session to the sink its streamed output goes to. The monitor
/// implements this with the channel send path; tests collect into memory.
pub trait OutputRouter: Send + Sync {
    fn sink_for(&self, key: &SessionKey) -> Arc<dyn OutputSink>;
}

pub struct NullOutputRouter;

struct NullSink;

#[async_trait]
impl OutputSink for NullSink {
    async fn send(&self, _text: &str) {}
}

impl OutputRouter for NullOutputRouter {
    fn sink_for(&self, _key: &SessionKey) -> Arc<dyn OutputSink> {
        Arc::new(NullSink)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// No run was active; a new one started.
    Started { run_id: String },
    /// Appended behind the active run (or parked during compaction).
    Queued { depth: usize },
    /// Injected into the active run as a follow-up user turn.
    Steered,
    /// Discarded per the session's drop mode.
    Dropped,
}

#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    /// Resolved by the worker before the first model call.
    pub model: Option<String>,
    pub provider: Option<String>,
    pub event_count: u64,
    pub recent_actions: Vec<String>,
    pub current_question: Option<String>,
    pub blocker_info: Option<BlockerInfo>,
}

impl RunSnapshot {
    fn of(run: &AgentRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            status: run.status,
            started_at: run.started_at,
            model: run.config.model.clone(),
            provider: run.config.provider.clone(),
            event_count: run.event_count,
            recent_actions: run.recent_actions().map(String::from).collect(),
            current_question: run.current_question.clone(),
            blocker_info: run.blocker_info.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_key: SessionKey,
    pub queue_mode: QueueMode,
    pub active: Option<RunSnapshot>,
    pub last: Option<RunSnapshot>,
    pub pending: usize,
    pub dropped: u64,
}

pub(crate) struct ActiveRun {
    pub run: Arc<std::sync::Mutex<AgentRun>>,
    pub steer_tx: mpsc::UnboundedSender<String>,
    pub cancel: CancellationToken,
    pub phase: Arc<PhaseCell>,
}

impl ActiveRun {
    fn is_terminal(&self) -> bool {
        self.run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .status
            .is_terminal()
    }
}

pub(crate) struct SessionSlot {
    pub queue_mode: QueueMode,
    pub active: Option<ActiveRun>,
    pub last: Option<RunSnapshot>,
    pub pending: VecDeque<(String, RunConfig)>,
    pub dropped: u64,
}

/// The per-session dispatch queue. Holding the slot lock is what makes a
/// session serial: submissions, steers, and completion handoffs for one
/// key never interleave.
pub struct Scheduler {
    pub(crate) ctx: Arc<CoreContext>,
    pub(crate) observer: Arc<dyn RunObserver>,
    pub(crate) output: Arc<dyn OutputRouter>,
    slots: DashMap<SessionKey, Arc<Mutex<SessionSlot>>>,
}

impl Scheduler {
    pub fn new(
        ctx: Arc<CoreContext>,
        observer: Arc<dyn RunObserver>,
        output: Arc<dyn OutputRouter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            observer,
            output,
            slots: DashMap::new(),
        })
    }

    /// Dispatch a prompt. Non-blocking beyond the slot lock: the run itself
    /// executes on its own worker task.
    pub async fn submit(
        self: &Arc<Self>,
        key: SessionKey,
        prompt: impl Into<String>,
        config: RunConfig,
    ) -> SubmitOutcome {
        let prompt = prompt.into();
        let slot_arc = self.slot(&key);
        let mut slot = slot_arc.lock().await;

        let active_alive = slot.active.as_ref().is_some_and(|a| !a.is_terminal());
        if !active_alive {
            let run_id = self.start_run_locked(&mut slot, key, prompt, config);
            return SubmitOutcome::Started { run_id };
        }

        match slot.queue_mode {
            QueueMode::Steer => {
                // Steering is forbidden while the run is compacting; park
                // the message in the queue instead.
                let compacting = slot
                    .active
                    .as_ref()
                    .map_or(false, |a| a.phase.get() == RunPhase::Compaction);
                if compacting {
                    slot.pending.push_back((prompt, config));
                    return SubmitOutcome::Queued {
                        depth: slot.pending.len(),
                    };
                }
                let steered = slot
                    .active
                    .as_ref()
                    .map_or(false, |a| a.steer_tx.send(prompt.clone()).is_ok());
                if steered {
                    drop(slot);
                    self.touch_entry(&key).await;
                    return SubmitOutcome::Steered;
                }
                // Worker already tore down its receiver; fall back to the
                // queue so the message is not lost.
                slot.pending.push_back((prompt, config));
                SubmitOutcome::Queued {
                    depth: slot.pending.len(),
                }
            }
            QueueMode::Enqueue => {
                slot.pending.push_back((prompt, config));
                SubmitOutcome::Queued {
                    depth: slot.pending.len(),
                }
            }
            QueueMode::Drop => {
                slot.dropped += 1;
                log::debug!(
                    "[{key}] dropped inbound message ({} so far)",
                    slot.dropped
                );
                SubmitOutcome::Dropped
            }
        }
    }

    /// Request cooperative cancellation of the active run.
    pub async fn cancel(&self, key: &SessionKey) -> bool {
        let slot_arc = self.slot(key);
        let slot = slot_arc.lock().await;
        match slot.active.as_ref() {
            Some(active) if !active.is_terminal() => {
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub async fn status(&self, key: &SessionKey) -> SessionState {
        let slot_arc = self.slot(key);
        let slot = slot_arc.lock().await;
        SessionState {
            session_key: key.clone(),
            queue_mode: slot.queue_mode,
            active: slot.active.as_ref().map(|a| {
                RunSnapshot::of(&a.run.lock().unwrap_or_else(|e| e.into_inner()))
            }),
            last: slot.last.clone(),
            pending: slot.pending.len(),
            dropped: slot.dropped,
        }
    }

    pub async fn set_queue_mode(&self, key: &SessionKey, mode: QueueMode) {
        let slot_arc = self.slot(key);
        slot_arc.lock().await.queue_mode = mode;
    }

    /// Called by the worker after its run reaches a terminal status: retire
    /// the active slot and start the next pending message, if any.
    pub(crate) async fn finish_run(self: &Arc<Self>, key: &SessionKey) {
        let slot_arc = self.slot(key);
        let mut slot = slot_arc.lock().await;
        if let Some(active) = slot.active.take() {
            slot.last = Some(RunSnapshot::of(
                &active.run.lock().unwrap_or_else(|e| e.into_inner()),
            ));
        }
        if let Some((prompt, config)) = slot.pending.pop_front() {
            self.start_run_locked(&mut slot, key.clone(), prompt, config);
        }
    }

    fn start_run_locked(
        self: &Arc<Self>,
        slot: &mut SessionSlot,
        key: SessionKey,
        prompt: String,
        config: RunConfig,
    ) -> String {
        let run = AgentRun::new(key.clone(), prompt, config);
        let run_id = run.run_id.clone();
        let run_arc = Arc::new(std::sync::Mutex::new(run));
        let (steer_tx, steer_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let phase = Arc::new(PhaseCell::new());

        slot.active = Some(ActiveRun {
            run: run_arc.clone(),
            steer_tx,
            cancel: cancel.clone(),
            phase: phase.clone(),
        });

        log::info!("[{key}] started run {run_id}");
        let scheduler = self.clone();
        tokio::spawn(async move {
            runner::execute(&scheduler, &key, run_arc, steer_rx, cancel, phase).await;
            scheduler.finish_run(&key).await;
        });

        run_id
    }

    async fn touch_entry(&self, key: &SessionKey) {
        let Some(snapshot) = self.ctx.store.get(key) else {
            return;
        };
        let result = self
            .ctx
            .store
            .upsert(key, |current| {
                let mut entry = current.unwrap_or(snapshot);
                entry.touch();
                entry
            })
            .await;
        if let Err(error) = result {
            log::warn!("[{key}] failed to touch session entry: {error}");
        }
    }

    fn slot(&self, key: &SessionKey) -> Arc<Mutex<SessionSlot>> {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SessionSlot {
                    queue_mode: self.ctx.config.scheduler.queue_mode,
                    active: None,
                    last: None,
                    pending: VecDeque::new(),
                    dropped: 0,
                }))
            })
            .clone()
    }
}
