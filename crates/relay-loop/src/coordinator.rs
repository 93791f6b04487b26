use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use relay_core::config::OutputMode;
use relay_core::error::{CoreError, TimeoutPhase};
use relay_core::event::RunObserver;
use relay_core::llm::{LlmClient, LlmRequest, TokenUsage};
use relay_core::message::Message;
use relay_core::run::BlockerInfo;
use relay_core::tools::{ToolCall, ToolExecutor, ToolResult};

use crate::blocker::BlockerDetector;
use crate::output::{OutputBuffer, OutputSink};
use crate::stream::consume_stream;
use crate::transcript;

/// What the coordinator is doing right now. The scheduler reads this
/// snapshot when a wall-clock timeout fires to classify the cause, and to
/// decide whether a steer may be injected (never during compaction).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    ModelCall,
    ToolExecution,
    Compaction,
}

#[derive(Debug)]
pub struct PhaseCell(Mutex<RunPhase>);

impl Default for PhaseCell {
    fn default() -> Self {
        Self(Mutex::new(RunPhase::Idle))
    }
}

impl PhaseCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, phase: RunPhase) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    pub fn get(&self) -> RunPhase {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn timeout_phase(&self) -> TimeoutPhase {
        match self.get() {
            RunPhase::ToolExecution => TimeoutPhase::ToolExecution,
            RunPhase::Compaction => TimeoutPhase::Compaction,
            RunPhase::ModelCall | RunPhase::Idle => TimeoutPhase::ModelCall,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub output_mode: OutputMode,
    pub tool_timeout: Duration,
    pub max_plan_retries: u32,
    /// Whether a detected blocker halts the stream instead of letting the
    /// model continue.
    pub halt_on_blocker: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            output_mode: OutputMode::default(),
            tool_timeout: Duration::from_secs(30),
            max_plan_retries: 4,
            halt_on_blocker: true,
        }
    }
}

/// Result of one complete turn (possibly many tool cycles).
#[derive(Debug, Default)]
pub struct TurnOutput {
    pub text: String,
    pub usage: TokenUsage,
    pub blocker: Option<BlockerInfo>,
    pub tool_cycles: u32,
}

/// Drives a single streaming call: text out, tool calls intercepted and
/// answered, steer messages folded in as follow-up user turns at cycle
/// boundaries. Cancellation is observed only at suspension points: between
/// stream chunks, before a tool dispatch, and between tool execution and
/// stream resume.
pub struct Coordinator {
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolExecutor>,
    observer: Arc<dyn RunObserver>,
    detector: BlockerDetector,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolExecutor>,
        observer: Arc<dyn RunObserver>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            llm,
            tools,
            observer,
            detector: BlockerDetector::new(),
            config,
        }
    }

    pub async fn drive(
        &self,
        run_id: &str,
        request: &LlmRequest,
        transcript: &mut Vec<Message>,
        steer_rx: &mut mpsc::UnboundedReceiver<String>,
        sink: &dyn OutputSink,
        cancel: &CancellationToken,
        phase: &PhaseCell,
    ) -> Result<TurnOutput, CoreError> {
        let repaired = transcript::repair(transcript)?;
        if repaired > 0 {
            log::warn!("[{run_id}] removed {repaired} orphaned tool results before resuming");
        }

        let mut buffer = OutputBuffer::new(self.config.output_mode);
        let mut output = TurnOutput::default();
        let mut consecutive_tool_cycles = 0u32;

        loop {
            drain_steer(transcript, steer_rx);
            if cancel.is_cancelled() {
                phase.set(RunPhase::Idle);
                return Err(CoreError::Cancelled);
            }

            phase.set(RunPhase::ModelCall);
            let mut cycle_request = request.clone();
            cycle_request.messages = transcript.clone();
            let stream = self
                .llm
                .stream(cycle_request, cancel.child_token())
                .await?;
            let segment = match consume_stream(stream, &mut buffer, sink, cancel).await {
                Ok(segment) => segment,
                Err(error) => {
                    phase.set(RunPhase::Idle);
                    return Err(error);
                }
            };

            add_usage(&mut output.usage, &segment.usage);
            output.text.push_str(&segment.text);

            if segment.tool_calls.is_empty() {
                if !segment.text.is_empty() {
                    transcript.push(Message::assistant(segment.text.clone(), None));
                }
                if let Some(blocker) = self.check_blocker(run_id, &segment.text) {
                    buffer.finish(sink).await;
                    phase.set(RunPhase::Idle);
                    output.blocker = Some(blocker);
                    return Ok(output);
                }
                // A steer may have raced in while the final segment was
                // streaming; fold it in as another cycle instead of
                // dropping it.
                if drain_steer(transcript, steer_rx) > 0 {
                    consecutive_tool_cycles = 0;
                    continue;
                }
                buffer.finish(sink).await;
                phase.set(RunPhase::Idle);
                return Ok(output);
            }

            transcript.push(Message::assistant(
                segment.text.clone(),
                Some(segment.tool_calls.clone()),
            ));

            if let Some(blocker) = self.check_blocker(run_id, &segment.text) {
                // Keep the transcript invariant before halting.
                answer_with_errors(transcript, &segment.tool_calls, "halted by blocker");
                buffer.finish(sink).await;
                phase.set(RunPhase::Idle);
                output.blocker = Some(blocker);
                return Ok(output);
            }

            consecutive_tool_cycles += 1;
            output.tool_cycles += 1;
            if consecutive_tool_cycles > self.config.max_plan_retries {
                answer_with_errors(transcript, &segment.tool_calls, "plan budget exhausted");
                phase.set(RunPhase::Idle);
                return Err(CoreError::PlanExhausted {
                    cycles: consecutive_tool_cycles,
                });
            }

            phase.set(RunPhase::ToolExecution);
            for call in &segment.tool_calls {
                if cancel.is_cancelled() {
                    answer_with_errors(transcript, &segment.tool_calls, "cancelled");
                    phase.set(RunPhase::Idle);
                    return Err(CoreError::Cancelled);
                }

                let result = match segment
                    .provider_results
                    .iter()
                    .find(|r| r.tool_call_id == call.id)
                {
                    Some(provided) => provided.clone(),
                    None => self.execute_tool(run_id, call, cancel).await?,
                };

                self.observer.on_tool_result(run_id, &result);
                transcript.push(tool_result_message(&result));
            }
            // Loop back: the cancel check at the top is the suspension
            // point between tool execution and stream resume.
        }
    }

    async fn execute_tool(
        &self,
        run_id: &str,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, CoreError> {
        match tokio::time::timeout(self.config.tool_timeout, self.tools.execute(call, cancel)).await
        {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(CoreError::Cancelled)) => Err(CoreError::Cancelled),
            Ok(Err(error)) => {
                log::warn!("[{run_id}] tool {} failed: {error}", call.name);
                Ok(ToolResult::error(&call.id, error.to_string()))
            }
            Err(_) => {
                // Surfaced to the run as a synthetic error result so the
                // model can recover; the run itself continues.
                log::warn!(
                    "[{run_id}] tool {} timed out after {}s",
                    call.name,
                    self.config.tool_timeout.as_secs()
                );
                Ok(ToolResult::error(
                    &call.id,
                    format!(
                        "timed out during {} after {}s",
                        TimeoutPhase::ToolExecution,
                        self.config.tool_timeout.as_secs()
                    ),
                ))
            }
        }
    }

    fn check_blocker(&self, run_id: &str, text: &str) -> Option<BlockerInfo> {
        if !self.config.halt_on_blocker || text.is_empty() {
            return None;
        }
        let blocker = self.detector.detect(text)?;
        log::warn!("[{run_id}] blocker detected: {}", blocker.reason);
        self.observer.on_blocker(run_id, &blocker);
        Some(blocker)
    }
}

fn drain_steer(transcript: &mut Vec<Message>, steer_rx: &mut mpsc::UnboundedReceiver<String>) -> usize {
    let mut injected = 0;
    while let Ok(text) = steer_rx.try_recv() {
        transcript.push(Message::user(text));
        injected += 1;
    }
    injected
}

fn add_usage(total: &mut TokenUsage, segment: &TokenUsage) {
    total.prompt_tokens += segment.prompt_tokens;
    total.completion_tokens += segment.completion_tokens;
    total.total_tokens += segment.total_tokens;
}

fn tool_result_message(result: &ToolResult) -> Message {
    let content = if result.is_error {
        format!("Error: {}", result.output)
    } else {
        result.output.clone()
    };
    Message::tool_result(result.tool_call_id.clone(), content)
}

fn answer_with_errors(transcript: &mut Vec<Message>, calls: &[ToolCall], reason: &str) {
    let answered: std::collections::HashSet<&str> = transcript
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    let missing: Vec<&ToolCall> = calls
        .iter()
        .filter(|c| !answered.contains(c.id.as_str()))
        .collect();
    for call in missing {
        transcript.push(Message::tool_result(
            call.id.clone(),
            format!("Error: {reason}"),
        ));
    }
}
