use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use relay_core::config::RateLimitConfig;

/// Result of a non-blocking `take`. Callers either proceed, or schedule a
/// retry after the hinted delay, or fail the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeOutcome {
    Admitted,
    Exhausted { retry_in_ms: u64 },
}

struct BucketState {
    tokens: u64,
    last_refill: Instant,
}

/// Token-bucket limiter. All state transitions happen under one mutex;
/// `take` never blocks.
pub struct TokenBucket {
    capacity: u64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.capacity, config.refill_per_sec)
    }

    pub fn take(&self, n: u64) -> TakeOutcome {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut state);

        if state.tokens >= n {
            state.tokens -= n;
            return TakeOutcome::Admitted;
        }

        let missing = n - state.tokens;
        let retry_in_ms = (missing as f64 / self.refill_per_sec * 1000.0).ceil() as u64;
        TakeOutcome::Exhausted { retry_in_ms }
    }

    pub fn available(&self) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut state);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(state.last_refill).as_millis() as u64;
        let earned = (elapsed_ms as f64 * self.refill_per_sec / 1000.0).floor() as u64;
        if earned == 0 {
            return;
        }

        state.tokens = (state.tokens + earned).min(self.capacity);
        if state.tokens == self.capacity {
            // A full bucket forfeits the surplus interval.
            state.last_refill = now;
        } else {
            // Advance only by the time the earned tokens account for, so
            // fractional refill is never lost.
            let consumed_ms = (earned as f64 * 1000.0 / self.refill_per_sec) as u64;
            state.last_refill += std::time::Duration::from_millis(consumed_ms);
        }
    }
}

/// Per-service limiters behind one mutex, created lazily from channel
/// configuration.
#[derive(Default)]
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, service_id: &str, config: &RateLimitConfig) -> Arc<TokenBucket> {
        let mut limiters = self.limiters.lock().unwrap_or_else(|e| e.into_inner());
        limiters
            .entry(service_id.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::from_config(config)))
            .clone()
    }

    pub fn get(&self, service_id: &str) -> Option<Arc<TokenBucket>> {
        let limiters = self.limiters.lock().unwrap_or_else(|e| e.into_inner());
        limiters.get(service_id).cloned()
    }
}
