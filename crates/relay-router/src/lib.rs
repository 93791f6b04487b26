//! Classifies raw user input into an intent and turns the classification
//! into a routing decision. Both halves are pure functions over the
//! configuration; no I/O happens here.

pub mod classifier;
pub mod router;

pub use classifier::{classify, IntentClassification, GENERAL_INTENT};
pub use router::{route, RoutingDecision};
