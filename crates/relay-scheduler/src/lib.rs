//! The execution kernel: one serial queue per session key, with steer,
//! enqueue, and drop modes; compaction and single-shot session reset on
//! recognized failures; retries for transient model errors under the
//! breaker. Exactly one run per key executes at any instant.

pub mod context;
pub mod prompt;
mod runner;
pub mod scheduler;
mod transcript_io;


pub use context::CoreContext;
pub use prompt::{build_system_prompt, SystemPromptInputs};
pub use scheduler::{
    NullOutputRouter, OutputRouter, RunSnapshot, Scheduler, SessionState, SubmitOutcome,
};
