use serde::{Deserialize, Serialize};

/// Observability configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

/// Logging configuration.
///
/// Logs are written to stderr; stdout is reserved for the prune list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// Log format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps.
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include file/line information.
    #[serde(default)]
    pub file_line: bool,

    /// Include span information in JSON output.
    #[serde(default = "default_true")]
    pub include_spans: bool,

    /// Filter directives (e.g., "snapkeep::retention=trace").
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            file_line: false,
            include_spans: true,
            filter: None,
        }
    }
}

fn default_log_level() -> LogLevel {
    LogLevel::Warn
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable multi-line format.
    Pretty,
    /// Compact single-line format.
    #[default]
    Compact,
    /// JSON format (for log aggregation).
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_logging() {
        let logging = LoggingConfig::default();
        assert_eq!(logging.level, LogLevel::Warn);
        assert_eq!(logging.format, LogFormat::Compact);
        assert!(logging.timestamps);
        assert!(!logging.file_line);
        assert!(logging.filter.is_none());
    }

    #[test]
    fn test_parse_logging() {
        let config: ObservabilityConfig = toml::from_str(
            r#"
            [logging]
            level = "debug"
            format = "json"
            timestamps = false
            filter = "snapkeep=trace"
        "#,
        )
        .unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(!config.logging.timestamps);
        assert_eq!(config.logging.filter.as_deref(), Some("snapkeep=trace"));
    }

    #[test]
    fn test_log_level_to_tracing_level() {
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
        assert_eq!(LogLevel::Warn.to_tracing_level(), tracing::Level::WARN);
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_rejects_unknown_format() {
        let result: Result<LoggingConfig, _> = toml::from_str(r#"format = "cef""#);
        assert!(result.is_err());
    }
}
