//! Drives a single LLM streaming call from start to finish: forwards
//! assistant text to the output sink, intercepts tool-call blocks, feeds
//! results back, and watches for blocker patterns. Cancellation is only
//! observed at suspension points; the current phase snapshot classifies
//! timeouts for the scheduler.

pub mod blocker;
pub mod coordinator;
pub mod output;
pub mod stream;
pub mod transcript;

pub use blocker::BlockerDetector;
pub use coordinator::{Coordinator, CoordinatorConfig, PhaseCell, RunPhase, TurnOutput};
pub use output::{OutputBuffer, OutputSink};
pub use stream::{consume_stream, StreamOutput};
