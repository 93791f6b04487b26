use relay_core::channel::OutboundTarget;
use relay_core::event::ChannelEvent;
use relay_core::session::SessionKey;

/// Compute the session key for an inbound event. Threads get their own
/// conversation (and so their own serial session) within the room.
pub fn session_key_for(agent_id: &str, event: &ChannelEvent) -> SessionKey {
    let scope = if event.is_direct { "dm" } else { "group" };
    let conversation = match &event.thread_id {
        Some(thread) => format!("{}/{}", event.room_id, thread),
        None => event.room_id.clone(),
    };
    SessionKey::new(agent_id, scope, &conversation)
}

/// Recover the outbound target from a session key produced by
/// `session_key_for`.
pub fn target_for(channel_id: &str, key: &SessionKey) -> OutboundTarget {
    let conversation = key.conversation_id();
    let (room_id, thread_id) = match conversation.split_once('/') {
        Some((room, thread)) => (room.to_string(), Some(thread.to_string())),
        None => (conversation.to_string(), None),
    };
    OutboundTarget {
        channel_id: channel_id.to_string(),
        room_id,
        thread_id,
    }
}
