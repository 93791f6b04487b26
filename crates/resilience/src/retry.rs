use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;

use relay_core::config::RetryConfig;
use relay_core::error::CoreError;

use crate::breaker::CircuitBreaker;

/// Delay before attempt `k` (1-based): exponential from `min_delay_ms`,
/// clamped to `[min_delay_ms, max_delay_ms]`, with symmetric jitter.
pub fn backoff_delay(policy: &RetryConfig, attempt: u32) -> Duration {
    let exponential = policy
        .min_delay_ms
        .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let clamped = exponential.clamp(policy.min_delay_ms, policy.max_delay_ms);

    let jittered = if policy.jitter > 0.0 {
        let factor = 1.0 + rand::thread_rng().gen_range(-policy.jitter..=policy.jitter);
        (clamped as f64 * factor).max(0.0) as u64
    } else {
        clamped
    };
    Duration::from_millis(jittered)
}

/// Drive `operation` through the retry policy, optionally gated by a
/// breaker. A provider `retry-after` hint overrides the exponential delay
/// for the next attempt. Non-retryable errors propagate immediately; when
/// the breaker is open the call fails fast with the remaining recovery
/// window as the hint.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryConfig,
    breaker: Option<&CircuitBreaker>,
    operation_name: &str,
    mut operation: F,
) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        if let Some(breaker) = breaker {
            if !breaker.can_execute() {
                log::warn!("{operation_name}: circuit open, failing fast");
                return Err(CoreError::RateLimited {
                    retry_after_ms: breaker.recovery_remaining_ms(),
                });
            }
        }

        match operation().await {
            Ok(value) => {
                if let Some(breaker) = breaker {
                    breaker.record_success();
                }
                if attempt > 1 {
                    log::info!("{operation_name}: succeeded on attempt {attempt}");
                }
                return Ok(value);
            }
            Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
            Err(error) => {
                if let Some(breaker) = breaker {
                    breaker.record_failure();
                }

                if !error.is_retryable() || attempt == attempts {
                    if attempt == attempts && error.is_retryable() {
                        log::warn!("{operation_name}: exhausted {attempts} attempts: {error}");
                    }
                    return Err(error);
                }

                let delay = error
                    .retry_after_ms()
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| backoff_delay(policy, attempt));
                log::debug!(
                    "{operation_name}: attempt {attempt}/{attempts} failed ({error}), retrying in {}ms",
                    delay.as_millis()
                );
                sleep(delay).await;
            }
        }
    }

    unreachable!("retry loop returns from its final attempt")
}
