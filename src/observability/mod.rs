//! Observability module providing structured logging.
//!
//! Log output goes to stderr in a configurable format (pretty, compact,
//! JSON) so that stdout stays machine-readable.

mod tracing_init;

pub use tracing_init::*;
