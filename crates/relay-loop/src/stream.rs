use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use relay_core::error::CoreError;
use relay_core::llm::{LlmStream, StreamEvent, TokenUsage};
use relay_core::tools::{ToolCall, ToolResult};

use crate::output::{OutputBuffer, OutputSink};

/// Everything one stream segment produced: the assistant text (already
/// forwarded through the output buffer), intercepted tool calls, any
/// provider-side tool results, and usage from the end event.
#[derive(Debug, Default)]
pub struct StreamOutput {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub provider_results: Vec<ToolResult>,
    pub usage: TokenUsage,
}

/// Consume one LLM stream to completion, forwarding text chunks as they
/// arrive. Cancellation is observed between chunks; a typed error event
/// terminates the segment with that error.
pub async fn consume_stream(
    mut stream: LlmStream,
    buffer: &mut OutputBuffer,
    sink: &dyn OutputSink,
    cancel: &CancellationToken,
) -> Result<StreamOutput, CoreError> {
    let mut output = StreamOutput::default();

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
            event = stream.next() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            StreamEvent::AssistantText { text } => {
                output.text.push_str(&text);
                buffer.push(sink, &text).await;
            }
            StreamEvent::ToolCall { id, name, input } => {
                output.tool_calls.push(ToolCall { id, name, input });
            }
            StreamEvent::ToolResult {
                id,
                output: tool_output,
                is_error,
            } => {
                output.provider_results.push(ToolResult {
                    tool_call_id: id,
                    output: tool_output,
                    is_error,
                });
            }
            StreamEvent::End { usage } => {
                output.usage = usage;
            }
            StreamEvent::Error { error } => {
                return Err(error);
            }
        }
    }

    Ok(output)
}
