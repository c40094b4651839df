//! snapkeep: retention marking for backup snapshots.
//!
//! Given a list of snapshot timestamps and a schedule of retention rules,
//! decides which snapshots to keep. Nothing is ever deleted; callers get the
//! kept and discarded lists back and act on them.

pub mod config;
pub mod instant;
pub mod observability;
pub mod retention;
pub mod schedule;

#[cfg(test)]
mod tests;
