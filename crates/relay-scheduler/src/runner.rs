use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use relay_core::error::{CoreError, TimeoutPhase};
use relay_core::event::{LifecycleEvent, RunObserver};
use relay_core::llm::LlmRequest;
use relay_core::message::{Message, Role};
use relay_core::run::{AgentRun, BlockerInfo, RunStatus};
use relay_core::session::{SessionEntry, SessionKey};
use relay_core::tools::ToolResult;
use relay_loop::{Coordinator, CoordinatorConfig, OutputSink, PhaseCell, RunPhase, TurnOutput};
use resilience::backoff_delay;

use crate::prompt::{build_system_prompt, SystemPromptInputs};
use crate::scheduler::Scheduler;
use crate::transcript_io::{read_transcript, write_transcript};

const COMPACTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Forwards coordinator callbacks to the caller's observer while keeping
/// the in-memory run object current for status snapshots.
struct RunTracker {
    run: Arc<std::sync::Mutex<AgentRun>>,
    inner: Arc<dyn RunObserver>,
}

impl RunTracker {
    fn with_run(&self, update: impl FnOnce(&mut AgentRun)) {
        let mut run = self.run.lock().unwrap_or_else(|e| e.into_inner());
        update(&mut run);
    }
}

impl RunObserver for RunTracker {
    fn on_state_change(&self, run_id: &str, status: RunStatus) {
        self.with_run(|run| run.set_status(status));
        self.inner.on_state_change(run_id, status);
    }

    fn on_tool_result(&self, run_id: &str, result: &ToolResult) {
        self.with_run(|run| {
            run.record_event();
            run.record_action(format!(
                "tool result {} ({})",
                result.tool_call_id,
                if result.is_error { "error" } else { "ok" }
            ));
        });
        self.inner.on_tool_result(run_id, result);
    }

    fn on_blocker(&self, run_id: &str, blocker: &BlockerInfo) {
        self.with_run(|run| run.blocker_info = Some(blocker.clone()));
        self.inner.on_blocker(run_id, blocker);
    }

    fn on_question(&self, run_id: &str, question: &str) {
        self.with_run(|run| {
            run.current_question = Some(question.to_string());
            run.set_status(RunStatus::WaitingForInput);
        });
        self.inner.on_question(run_id, question);
    }
}

/// One worker per active run: resolve the session entry and model, build
/// the deterministic system prompt, drive the coordinator, and handle
/// compaction, reset-and-retry, and transient-error retries.
pub(crate) async fn execute(
    scheduler: &Arc<Scheduler>,
    key: &SessionKey,
    run: Arc<std::sync::Mutex<AgentRun>>,
    mut steer_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
    phase: Arc<PhaseCell>,
) {
    let ctx = scheduler.ctx.clone();
    let sink = scheduler.output.sink_for(key);
    let tracker: Arc<dyn RunObserver> = Arc::new(RunTracker {
        run: run.clone(),
        inner: scheduler.observer.clone(),
    });

    let (prompt, config, run_id) = {
        let run = run.lock().unwrap_or_else(|e| e.into_inner());
        (run.prompt.clone(), run.config.clone(), run.run_id.clone())
    };

    // Session entry: created on the first inbound message for this key.
    let defaults = ctx.config.agents.defaults.clone();
    let transcripts_dir = ctx.store.transcripts_dir().to_path_buf();
    let created = ctx.store.get(key).is_none();
    let entry_result = ctx
        .store
        .upsert(key, |current| match current {
            Some(mut entry) => {
                entry.touch();
                entry
            }
            None => SessionEntry::new(
                &defaults.provider,
                &defaults.model,
                defaults.thinking_level,
                defaults.context_tokens,
                &transcripts_dir,
            ),
        })
        .await;
    let mut entry = match entry_result {
        Ok(entry) => entry,
        Err(error) => {
            let error = CoreError::Fatal(format!("session store unavailable: {error}"));
            finish(&tracker, &run_id, RunStatus::Failed, Some(&error), sink.as_ref()).await;
            return;
        }
    };
    if created {
        ctx.emit(LifecycleEvent::SessionStart {
            session_key: key.clone(),
        });
    }

    // Model resolution: run override, then per-agent default, then the
    // session entry (which carries the process default).
    let model = config
        .model
        .clone()
        .or_else(|| ctx.config.agents.models.get(key.agent_id()).cloned())
        .unwrap_or_else(|| entry.model.clone());
    let provider = config.provider.clone().unwrap_or_else(|| entry.provider.clone());
    let thinking_level = config.thinking_level.unwrap_or(entry.thinking_level);
    {
        // The run handle always carries the resolved model and provider.
        let mut run = run.lock().unwrap_or_else(|e| e.into_inner());
        run.config.model = Some(model.clone());
        run.config.provider = Some(provider.clone());
    }

    let system_prompt = build_system_prompt(&SystemPromptInputs {
        agent_id: key.agent_id().to_string(),
        identity: String::new(),
        bootstrap_files: Vec::new(),
        skills: Vec::new(),
        host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        channel: key.scope().to_string(),
        timezone: "UTC".to_string(),
        tool_names: ctx.tools.list_tools().into_iter().map(|t| t.name).collect(),
        sandboxed: false,
    });

    let request = LlmRequest {
        messages: Vec::new(),
        tools: ctx.tools.list_tools(),
        system_prompt: system_prompt.clone(),
        provider: provider.clone(),
        model,
        thinking_level,
        session_file: Some(entry.session_file.clone()),
        resume_token: entry.resume_token.clone(),
    };

    let coordinator = Coordinator::new(
        ctx.llm.clone(),
        ctx.tools.clone(),
        tracker.clone(),
        CoordinatorConfig {
            output_mode: config.output_mode.unwrap_or(ctx.config.scheduler.output_mode),
            tool_timeout: Duration::from_secs(ctx.config.scheduler.tool_timeout_secs),
            max_plan_retries: ctx.config.scheduler.max_plan_retries,
            halt_on_blocker: true,
        },
    );

    let mut transcript = read_transcript(&entry.session_file).await;
    if !transcript.iter().any(|m| m.role == Role::System) {
        transcript.insert(0, Message::system(system_prompt.clone()));
    }
    transcript.push(Message::user(prompt.clone()));

    let breaker = ctx.breakers.get_or_create(&format!("llm:{provider}"));
    let retry_policy = ctx.config.retry.clone();
    let mut reset_used = false;
    let mut attempt = 1u32;

    tracker.on_state_change(&run_id, RunStatus::Running);

    let outcome: Result<TurnOutput, CoreError> = loop {
        let attempt_cancel = cancel.child_token();
        let drive = coordinator.drive(
            &run_id,
            &request,
            &mut transcript,
            &mut steer_rx,
            sink.as_ref(),
            &attempt_cancel,
            &phase,
        );

        let result = match config.timeout {
            Some(limit) => match tokio::time::timeout(limit, drive).await {
                Ok(result) => result,
                Err(_) => {
                    // Classify from the coordinator's current phase, then
                    // trip the token so the worker unwinds cooperatively.
                    let timeout_phase = phase.timeout_phase();
                    attempt_cancel.cancel();
                    Err(CoreError::Timeout {
                        phase: timeout_phase,
                    })
                }
            },
            None => drive.await,
        };

        match result {
            Ok(output) => {
                breaker.record_success();
                break Ok(output);
            }
            Err(CoreError::Cancelled) => break Err(CoreError::Cancelled),
            Err(CoreError::InsufficientContext) => {
                phase.set(RunPhase::Compaction);
                match compact(&ctx, key, &mut entry, &mut transcript, &prompt).await {
                    Ok(count) => {
                        log::info!("[{key}] compacted session (count {count})");
                        ctx.emit(LifecycleEvent::SessionCompacted {
                            session_key: key.clone(),
                            count,
                        });
                        phase.set(RunPhase::Idle);
                        continue;
                    }
                    Err(error) if error.triggers_session_reset() && !reset_used => {
                        reset_used = true;
                        phase.set(RunPhase::Idle);
                        match reset_session(&ctx, key, &mut entry, &error).await {
                            Ok(()) => {
                                transcript =
                                    fresh_transcript(&system_prompt, &prompt);
                                continue;
                            }
                            Err(reset_error) => break Err(reset_error),
                        }
                    }
                    Err(error) => {
                        phase.set(RunPhase::Idle);
                        break Err(error);
                    }
                }
            }
            Err(error) if error.triggers_session_reset() && !reset_used => {
                reset_used = true;
                match reset_session(&ctx, key, &mut entry, &error).await {
                    Ok(()) => {
                        transcript = fresh_transcript(&system_prompt, &prompt);
                        continue;
                    }
                    Err(reset_error) => break Err(reset_error),
                }
            }
            Err(error) if error.is_retryable() => {
                breaker.record_failure();
                if attempt >= retry_policy.attempts.max(1) {
                    break Err(error);
                }
                if !breaker.can_execute() {
                    break Err(CoreError::RateLimited {
                        retry_after_ms: breaker.recovery_remaining_ms(),
                    });
                }
                let delay = error
                    .retry_after_ms()
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| backoff_delay(&retry_policy, attempt));
                log::debug!(
                    "[{key}] run attempt {attempt} failed ({error}), retrying in {}ms",
                    delay.as_millis()
                );
                attempt += 1;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = cancel.cancelled() => break Err(CoreError::Cancelled),
                }
            }
            Err(error) => break Err(error),
        }
    };

    // Flush the transcript regardless of outcome; a partial transcript is
    // still the session's state of record.
    if let Err(error) = write_transcript(&entry.session_file, &transcript).await {
        log::warn!("[{key}] failed to persist transcript: {error}");
    }

    match outcome {
        Ok(output) => {
            if let Some(blocker) = output.blocker.clone() {
                persist_outcome(&ctx, key, &entry, |entry| {
                    entry.system_sent = true;
                    entry.blocker_info = Some(blocker.clone());
                    entry.record_usage(&output.usage);
                })
                .await;
                ctx.emit(LifecycleEvent::RunBlocked {
                    session_key: key.clone(),
                    run_id: run_id.clone(),
                    blocker,
                });
                finish(&tracker, &run_id, RunStatus::Blocked, None, sink.as_ref()).await;
            } else {
                persist_outcome(&ctx, key, &entry, |entry| {
                    entry.system_sent = true;
                    entry.blocker_info = None;
                    entry.record_usage(&output.usage);
                })
                .await;
                ctx.emit(LifecycleEvent::AgentReply {
                    session_key: key.clone(),
                    run_id: run_id.clone(),
                    turn_id: Uuid::new_v4().to_string(),
                    input: prompt,
                    output: output.text,
                });
                finish(&tracker, &run_id, RunStatus::Completed, None, sink.as_ref()).await;
            }
        }
        Err(CoreError::Cancelled) => {
            persist_outcome(&ctx, key, &entry, |entry| {
                entry.aborted_last_run = true;
            })
            .await;
            finish(&tracker, &run_id, RunStatus::Cancelled, None, sink.as_ref()).await;
        }
        Err(error) => {
            log::warn!("[{key}] run {run_id} failed: {error}");
            persist_outcome(&ctx, key, &entry, |entry| {
                entry.aborted_last_run = true;
            })
            .await;
            finish(&tracker, &run_id, RunStatus::Failed, Some(&error), sink.as_ref()).await;
        }
    }
}

/// Set the terminal status and, on failure, deliver exactly one error
/// payload to the caller. Streamed partial output is never retracted.
async fn finish(
    tracker: &Arc<dyn RunObserver>,
    run_id: &str,
    status: RunStatus,
    error: Option<&CoreError>,
    sink: &dyn OutputSink,
) {
    if let Some(error) = error {
        sink.send(&error_payload(error)).await;
    }
    tracker.on_state_change(run_id, status);
}

fn error_payload(error: &CoreError) -> String {
    match error.retry_after_ms() {
        Some(ms) => format!("The request failed: {error}. Retry in {ms}ms."),
        None => format!("The request failed: {error}."),
    }
}

fn fresh_transcript(system_prompt: &str, prompt: &str) -> Vec<Message> {
    vec![Message::system(system_prompt), Message::user(prompt)]
}

/// Compaction: count it under the per-key write lock, run the LLM
/// summarization pass under its own timeout, and shrink the transcript to
/// system + summary + the original prompt.
async fn compact(
    ctx: &crate::context::CoreContext,
    key: &SessionKey,
    entry: &mut SessionEntry,
    transcript: &mut Vec<Message>,
    original_prompt: &str,
) -> Result<u32, CoreError> {
    let fallback = entry.clone();
    let updated = ctx
        .store
        .upsert(key, |current| {
            let mut entry = current.unwrap_or(fallback);
            entry.compaction_count += 1;
            entry.touch();
            entry
        })
        .await
        .map_err(|error| CoreError::Fatal(format!("session store unavailable: {error}")))?;
    *entry = updated;

    let summary = match tokio::time::timeout(COMPACTION_TIMEOUT, ctx.llm.summarize(transcript))
        .await
    {
        Ok(Ok(summary)) => summary,
        Ok(Err(error)) => return Err(error),
        Err(_) => {
            return Err(CoreError::Timeout {
                phase: TimeoutPhase::Compaction,
            })
        }
    };

    let system = transcript.iter().find(|m| m.role == Role::System).cloned();
    let mut compacted = Vec::new();
    if let Some(system) = system {
        compacted.push(system);
    }
    compacted.push(Message::user(format!(
        "Summary of the conversation so far:\n{summary}"
    )));
    compacted.push(Message::user(original_prompt.to_string()));
    *transcript = compacted;
    Ok(entry.compaction_count)
}

/// Session reset: best-effort delete of the old transcript first, then the
/// new entry commits under the write lock, then the lifecycle event.
async fn reset_session(
    ctx: &crate::context::CoreContext,
    key: &SessionKey,
    entry: &mut SessionEntry,
    reason: &CoreError,
) -> Result<(), CoreError> {
    log::warn!("[{key}] resetting session: {reason}");
    ctx.store.remove_transcript(&entry.session_file).await;

    let transcripts_dir = ctx.store.transcripts_dir().to_path_buf();
    let fallback = entry.clone();
    let updated = ctx
        .store
        .upsert(key, |current| {
            let mut entry = current.unwrap_or(fallback);
            entry.reset(&transcripts_dir);
            entry
        })
        .await
        .map_err(|error| CoreError::Fatal(format!("session store unavailable: {error}")))?;
    *entry = updated;

    ctx.emit(LifecycleEvent::SessionReset {
        session_key: key.clone(),
        reason: reason.to_string(),
    });
    Ok(())
}

async fn persist_outcome(
    ctx: &crate::context::CoreContext,
    key: &SessionKey,
    fallback: &SessionEntry,
    update: impl FnOnce(&mut SessionEntry),
) {
    let fallback = fallback.clone();
    let result = ctx
        .store
        .upsert(key, |current| {
            let mut entry = current.unwrap_or(fallback);
            update(&mut entry);
            entry.touch();
            entry
        })
        .await;
    if let Err(error) = result {
        log::warn!("[{key}] failed to persist session outcome: {error}");
    }
}
