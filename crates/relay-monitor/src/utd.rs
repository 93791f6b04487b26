use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use relay_core::config::MonitorConfig;
use relay_core::event::ChannelEvent;

/// What to do with a parked undecryptable event this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtdDisposition {
    /// Within the retry window: try the crypto store again.
    Retry,
    /// Out of normal retries: consult the key-backup fallback.
    KeyBackup,
    /// Past the retry window but not yet expired: leave it parked.
    Park,
    /// Past hard expiry: give up.
    Expire,
}

#[derive(Debug)]
pub struct UtdEntry {
    pub event: ChannelEvent,
    pub first_seen: Instant,
    pub retries: u32,
}

/// Bounded FIFO queue of undecryptable events awaiting keys. Capacity
/// overflow evicts the oldest entry; age decides retry vs. backup vs.
/// expiry.
pub struct UtdQueue {
    capacity: usize,
    retry_window: Duration,
    expiry: Duration,
    max_retries: u32,
    entries: VecDeque<UtdEntry>,
}

impl UtdQueue {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            capacity: config.utd_capacity.max(1),
            retry_window: Duration::from_secs(config.utd_retry_window_secs),
            expiry: Duration::from_secs(config.utd_expiry_secs),
            max_retries: config.utd_max_retries,
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, event: ChannelEvent) {
        if self.entries.len() == self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                log::warn!(
                    "UTD queue full, evicting oldest event {}",
                    evicted.event.event_id
                );
            }
        }
        self.entries.push_back(UtdEntry {
            event,
            first_seen: Instant::now(),
            retries: 0,
        });
    }

    /// Drain all entries, oldest first. Callers process each one according
    /// to its disposition and `requeue` what stays parked; processing in
    /// drain order keeps the queue FIFO.
    pub fn drain(&mut self) -> Vec<UtdEntry> {
        self.entries.drain(..).collect()
    }

    pub fn requeue(&mut self, entry: UtdEntry) {
        self.entries.push_back(entry);
    }

    pub fn disposition(&self, entry: &UtdEntry) -> UtdDisposition {
        let age = entry.first_seen.elapsed();
        if age >= self.expiry {
            return UtdDisposition::Expire;
        }
        if entry.retries >= self.max_retries {
            return UtdDisposition::KeyBackup;
        }
        if age <= self.retry_window {
            return UtdDisposition::Retry;
        }
        UtdDisposition::Park
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
