use std::collections::HashSet;

use relay_core::config::{ChannelConfig, DmPolicy, GroupPolicy};
use relay_core::event::ChannelEvent;

/// Sender-level access control. Disallowed senders are dropped silently:
/// the caller logs at debug and moves on, nothing is sent back.
pub struct AccessControl {
    config: ChannelConfig,
    paired: HashSet<String>,
}

impl AccessControl {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            paired: HashSet::new(),
        }
    }

    /// Record a completed pairing handshake for `pairing`-policy DMs.
    pub fn pair(&mut self, sender_id: &str) {
        self.paired.insert(sender_id.to_string());
    }

    pub fn allows(&self, event: &ChannelEvent) -> bool {
        if event.is_own_message {
            return false;
        }
        if event.is_direct {
            match self.config.policy {
                DmPolicy::Open => true,
                DmPolicy::Allowlist => self.in_allowlist(&event.sender_id),
                DmPolicy::Pairing => {
                    self.paired.contains(&event.sender_id) || self.in_allowlist(&event.sender_id)
                }
                DmPolicy::Disabled => false,
            }
        } else {
            match self.config.group_policy {
                GroupPolicy::Open => true,
                GroupPolicy::Allowlist => self.in_allowlist(&event.sender_id),
                GroupPolicy::Disabled => false,
            }
        }
    }

    fn in_allowlist(&self, sender_id: &str) -> bool {
        self.config
            .allow_from
            .iter()
            .any(|allowed| allowed == sender_id || allowed == "*")
    }
}
