use std::collections::HashSet;

use relay_core::error::CoreError;
use relay_core::message::{Message, Role};

/// Repair a transcript so that every assistant turn carrying tool-call
/// blocks is followed by exactly the matching tool-result turns. Orphaned
/// results (left behind by truncation or replay) are removed; a missing
/// result cannot be synthesized, so it surfaces as a role-ordering
/// conflict and the scheduler resets the session.
///
/// Returns the number of messages removed.
pub fn repair(messages: &mut Vec<Message>) -> Result<usize, CoreError> {
    let mut keep = vec![true; messages.len()];
    let mut open_call_ids: HashSet<String> = HashSet::new();

    for (index, message) in messages.iter().enumerate() {
        match message.role {
            Role::Assistant => {
                if !open_call_ids.is_empty() {
                    // Previous assistant turn still has unanswered calls.
                    return Err(CoreError::RoleOrderingConflict);
                }
                if let Some(calls) = &message.tool_calls {
                    open_call_ids = calls.iter().map(|c| c.id.clone()).collect();
                }
            }
            Role::Tool => {
                let call_id = message.tool_call_id.as_deref().unwrap_or_default();
                if !open_call_ids.remove(call_id) {
                    // Unmatched result: drop it.
                    keep[index] = false;
                }
            }
            Role::User | Role::System => {
                if !open_call_ids.is_empty() {
                    return Err(CoreError::RoleOrderingConflict);
                }
            }
        }
    }

    if !open_call_ids.is_empty() {
        return Err(CoreError::RoleOrderingConflict);
    }

    let removed = keep.iter().filter(|kept| !**kept).count();
    if removed > 0 {
        let mut keep_iter = keep.into_iter();
        messages.retain(|_| keep_iter.next().unwrap_or(true));
    }
    Ok(removed)
}

/// Check the tool-call/result pairing invariant without mutating.
pub fn validate(messages: &[Message]) -> Result<(), CoreError> {
    let mut probe = messages.to_vec();
    let removed = repair(&mut probe)?;
    if removed > 0 {
        return Err(CoreError::RoleOrderingConflict);
    }
    Ok(())
}
