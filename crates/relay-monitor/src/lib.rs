//! The inbound channel monitor: one long-poll loop per account that
//! deduplicates, decrypts, normalizes, and access-checks remote events,
//! then hands each one to the scheduler in strict per-room order. Progress
//! (sync cursor + dedup set) is persisted so a crash redelivers events
//! instead of losing them.

pub mod access;
pub mod cursor;
pub mod dedup;
pub mod dispatch;
pub mod ingest;
pub mod monitor;
pub mod normalize;
pub mod outbound;
pub mod utd;

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod monitor_tests;

pub use access::AccessControl;
pub use cursor::{CursorStore, SyncState};
pub use dedup::DedupSet;
pub use dispatch::RoomDispatcher;
pub use ingest::{session_key_for, target_for};
pub use monitor::{Dispatch, Monitor, MonitorState};
pub use outbound::{send_with_backoff, ChannelOutput};
pub use utd::{UtdDisposition, UtdEntry, UtdQueue};
