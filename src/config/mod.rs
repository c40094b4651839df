//! Configuration module.
//!
//! snapkeep is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! [policy]
//! reach_factor = 0.5
//! utc_offset = "${SNAPSHOT_TZ_OFFSET}"
//!
//! [[policy.rules]]
//! every = "1d"
//! keep_for = "6mo"
//!
//! [observability.logging]
//! level = "info"
//! ```

mod observability;
mod policy;

use std::path::Path;

pub use observability::*;
pub use policy::*;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static ENV_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").expect("env var pattern is a valid regex"));

/// Root configuration.
///
/// All sections are optional; an empty file yields the default policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapkeepConfig {
    /// Retention policy.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Observability configuration (logging).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl SnapkeepConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing required variables will cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let config: SnapkeepConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    fn validate(&self) -> Result<(), ConfigError> {
        self.policy.validate().map_err(ConfigError::Validation)?;
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Expand environment variables in the format `${VAR_NAME}`.
/// Skips variables that appear after a `#` on the same line.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut last_end = 0;

        for cap in ENV_VAR.captures_iter(line) {
            let Some(whole) = cap.get(0) else {
                continue;
            };

            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            result.push_str(&value);

            last_end = whole.end();
        }

        result.push_str(&line[last_end..]);
        result.push('\n');
    }

    // Remove trailing newline if input didn't have one
    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}
