use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use relay_core::channel::{ChannelAdapter, OutboundTarget, SendOpts};
use relay_core::config::RetryConfig;
use relay_core::error::CoreError;
use relay_core::session::SessionKey;
use relay_loop::OutputSink;
use relay_scheduler::OutputRouter;
use resilience::{run_with_retry, CircuitBreaker, TakeOutcome, TokenBucket};

use crate::ingest::target_for;

/// Cap on how long a Retry-After hint can stall the send path.
const MAX_AUTO_RETRY: Duration = Duration::from_secs(30);

/// Outbound send: pace through the token bucket, try once, honor a single
/// Retry-After-bounded automatic retry, and push anything beyond that
/// through the retry driver under the breaker.
pub async fn send_with_backoff(
    adapter: &dyn ChannelAdapter,
    target: &OutboundTarget,
    text: &str,
    opts: &SendOpts,
    limiter: &TokenBucket,
    breaker: &CircuitBreaker,
    retry: &RetryConfig,
) -> Result<String, CoreError> {
    if let TakeOutcome::Exhausted { retry_in_ms } = limiter.take(1) {
        log::debug!("send paced by rate limiter, waiting {retry_in_ms}ms");
        tokio::time::sleep(Duration::from_millis(retry_in_ms)).await;
        // One paced retry; a still-empty bucket fails the request.
        if let TakeOutcome::Exhausted { retry_in_ms } = limiter.take(1) {
            return Err(CoreError::RateLimited {
                retry_after_ms: Some(retry_in_ms),
            });
        }
    }

    match adapter.send_text(target, text, opts).await {
        Ok(message_id) => return Ok(message_id),
        Err(CoreError::RateLimited { retry_after_ms }) => {
            // Single automatic retry bounded by the server hint.
            let wait = Duration::from_millis(retry_after_ms.unwrap_or(1_000)).min(MAX_AUTO_RETRY);
            log::debug!("send rate limited, automatic retry in {}ms", wait.as_millis());
            tokio::time::sleep(wait).await;
            match adapter.send_text(target, text, opts).await {
                Ok(message_id) => return Ok(message_id),
                Err(CoreError::RateLimited { .. }) => {}
                Err(error) => return Err(error),
            }
        }
        Err(error) => return Err(error),
    }

    // Still rate limited: everything further goes through the retry
    // driver, gated by the per-channel breaker.
    run_with_retry(retry, Some(breaker), "channel send", || async {
        adapter.send_text(target, text, opts).await
    })
    .await
}

/// Routes scheduler output back onto the channel, one sink per session.
pub struct ChannelOutput {
    channel_id: String,
    adapter: Arc<dyn ChannelAdapter>,
    limiter: Arc<TokenBucket>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
}

impl ChannelOutput {
    /// `limiter` and `breaker` come from the core context's registries so
    /// the send path shares pacing state with everything else talking to
    /// this channel.
    pub fn new(
        channel_id: impl Into<String>,
        adapter: Arc<dyn ChannelAdapter>,
        limiter: Arc<TokenBucket>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            adapter,
            limiter,
            breaker,
            retry,
        }
    }
}

impl OutputRouter for ChannelOutput {
    fn sink_for(&self, key: &SessionKey) -> Arc<dyn OutputSink> {
        Arc::new(ChannelSink {
            target: target_for(&self.channel_id, key),
            adapter: self.adapter.clone(),
            limiter: self.limiter.clone(),
            breaker: self.breaker.clone(),
            retry: self.retry.clone(),
        })
    }
}

struct ChannelSink {
    target: OutboundTarget,
    adapter: Arc<dyn ChannelAdapter>,
    limiter: Arc<TokenBucket>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
}

#[async_trait]
impl OutputSink for ChannelSink {
    async fn send(&self, text: &str) {
        let result = send_with_backoff(
            self.adapter.as_ref(),
            &self.target,
            text,
            &SendOpts::default(),
            &self.limiter,
            &self.breaker,
            &self.retry,
        )
        .await;
        if let Err(error) = result {
            log::warn!(
                "failed to deliver reply to {}: {error}",
                self.target.room_id
            );
        }
    }
}
