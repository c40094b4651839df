//! Retention marking.
//!
//! Decides which snapshot timestamps a retention schedule keeps. Each rule
//! walks backward from a reference instant one window at a time and keeps
//! the single candidate nearest to the middle of that window, if one lies
//! within the rule's search radius. Rules are applied cumulatively: a
//! candidate kept by any rule is kept.
//!
//! This module never deletes anything; it only partitions a list.

mod engine;
mod rule;
mod walker;

pub use engine::{DEFAULT_REACH_FACTOR, EngineConfig, RetentionEngine, partition};
pub use rule::{Edges, RetentionRule, Stepping};

/// Errors raised while partitioning.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetentionError {
    #[error("Invalid timestamp at position {index}: {reason}")]
    InvalidTimestamp { index: usize, reason: String },

    #[error("Invalid retention rule: {0}")]
    InvalidRule(String),
}
