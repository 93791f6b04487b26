use async_trait::async_trait;
use tokio::sync::mpsc;

use relay_core::config::OutputMode;

/// Where user-visible assistant text goes. The monitor wires this to the
/// channel adapter's send path; tests collect into a channel.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn send(&self, text: &str);
}

#[async_trait]
impl OutputSink for mpsc::Sender<String> {
    async fn send(&self, text: &str) {
        let _ = mpsc::Sender::send(self, text.to_string()).await;
    }
}

/// Buffers streamed chunks and flushes them according to the configured
/// output mode. Chunks are emitted in stream order; tool-result insertions
/// never reorder surrounding text.
pub struct OutputBuffer {
    mode: OutputMode,
    pending: String,
}

impl OutputBuffer {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            pending: String::new(),
        }
    }

    pub async fn push(&mut self, sink: &dyn OutputSink, chunk: &str) {
        self.pending.push_str(chunk);
        let delimiter = match self.mode {
            OutputMode::Line => "\n",
            OutputMode::Paragraph => "\n\n",
            OutputMode::MessageEnd => return,
        };

        while let Some(index) = self.pending.find(delimiter) {
            let segment: String = self.pending[..index].to_string();
            self.pending.drain(..index + delimiter.len());
            if !segment.trim().is_empty() {
                sink.send(&segment).await;
            }
        }
    }

    /// Flush whatever is left; called at message end.
    pub async fn finish(&mut self, sink: &dyn OutputSink) {
        if !self.pending.trim().is_empty() {
            let remainder = std::mem::take(&mut self.pending);
            sink.send(remainder.trim_end()).await;
        } else {
            self.pending.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn line_mode_flushes_complete_lines() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut buffer = OutputBuffer::new(OutputMode::Line);

        buffer.push(&tx, "first li").await;
        buffer.push(&tx, "ne\nsecond").await;
        assert_eq!(drain(&mut rx).await, vec!["first line"]);

        buffer.finish(&tx).await;
        assert_eq!(drain(&mut rx).await, vec!["second"]);
    }

    #[tokio::test]
    async fn paragraph_mode_waits_for_blank_line() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut buffer = OutputBuffer::new(OutputMode::Paragraph);

        buffer.push(&tx, "one\ntwo\n\nthree").await;
        assert_eq!(drain(&mut rx).await, vec!["one\ntwo"]);

        buffer.finish(&tx).await;
        assert_eq!(drain(&mut rx).await, vec!["three"]);
    }

    #[tokio::test]
    async fn message_end_mode_buffers_everything() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut buffer = OutputBuffer::new(OutputMode::MessageEnd);

        buffer.push(&tx, "hello\n").await;
        buffer.push(&tx, "world").await;
        assert!(drain(&mut rx).await.is_empty());

        buffer.finish(&tx).await;
        assert_eq!(drain(&mut rx).await, vec!["hello\nworld"]);
    }

    #[tokio::test]
    async fn whitespace_only_segments_are_suppressed() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut buffer = OutputBuffer::new(OutputMode::Line);
        buffer.push(&tx, "   \n").await;
        buffer.finish(&tx).await;
        assert!(drain(&mut rx).await.is_empty());
    }
}
