//! Reactivation analysis
//!
//! Decides whether a comment on a finished task is a new work request or
//! merely conversational.

mod analyzer;

pub use analyzer::{ReactivationAnalyzer, ReactivationDecision};
