//! Consolidated test modules.
//!
//! End-to-end retention scenarios and property-based checks that exercise
//! the engine through its public surface.
