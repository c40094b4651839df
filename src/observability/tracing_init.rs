//! Tracing initialization with configurable logging formats.

use tracing_subscriber::{
    EnvFilter, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingConfig, ObservabilityConfig};

/// Initialize the tracing subscriber with the given configuration.
///
/// This sets up:
/// - Stderr logging with configurable format (pretty, compact, JSON)
/// - Environment-based log filtering (`RUST_LOG` wins over the config)
pub fn init_tracing(config: &ObservabilityConfig) -> Result<(), TracingError> {
    let logging = &config.logging;
    let filter = build_env_filter(logging);

    let result = match (&logging.format, logging.timestamps) {
        (LogFormat::Pretty, true) => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(logging.file_line)
                .with_line_number(logging.file_line);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
        (LogFormat::Pretty, false) => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(logging.file_line)
                .with_line_number(logging.file_line)
                .without_time();
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
        (LogFormat::Compact, true) => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(logging.file_line)
                .with_line_number(logging.file_line);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
        (LogFormat::Compact, false) => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(logging.file_line)
                .with_line_number(logging.file_line)
                .without_time();
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
        (LogFormat::Json, true) => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_file(logging.file_line)
                .with_line_number(logging.file_line)
                .with_current_span(logging.include_spans);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
        (LogFormat::Json, false) => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_file(logging.file_line)
                .with_line_number(logging.file_line)
                .with_current_span(logging.include_spans)
                .without_time();
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
    };

    result.map_err(|e| TracingError::Init(e.to_string()))
}

fn build_env_filter(config: &LoggingConfig) -> EnvFilter {
    let base_level = LevelFilter::from_level(config.level.to_tracing_level()).to_string();

    // Check for RUST_LOG environment variable first
    if let Ok(env_filter) = std::env::var("RUST_LOG") {
        EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new(&base_level))
    } else if let Some(filter) = &config.filter {
        let combined = format!("{},{}", base_level, filter);
        EnvFilter::try_new(combined).unwrap_or_else(|_| EnvFilter::new(&base_level))
    } else {
        EnvFilter::new(&base_level)
    }
}

/// Tracing initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("Failed to initialize tracing: {0}")]
    Init(String),
}
