//! Retention policy configuration.
//!
//! Describes the schedule tiers and how snapshot names are turned into
//! timestamps.
//!
//! # Example
//!
//! ```toml
//! [policy]
//! reach_factor = 0.5
//! auto_sync = false
//! utc_offset = "+00:00"
//! extract_pattern = '(\d{8}T\d{6})'
//!
//! [[policy.rules]]
//! every = "6h"
//! keep_for = "3mo"
//!
//! [[policy.rules]]
//! every = "1d"
//! keep_for = "6mo"
//! reach_factor = 0.75
//! ```

use chrono::FixedOffset;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    instant::{InstantError, TimestampParser, parse_offset},
    retention::{DEFAULT_REACH_FACTOR, EngineConfig, RetentionEngine},
    schedule::{CalendarSpan, ScheduleError, ScheduleRule},
};

/// Retention policy.
///
/// Rules are applied cumulatively: a snapshot kept by any rule is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    /// Default search radius multiplier for rules without their own.
    /// Default: 0.5
    #[serde(default = "default_reach_factor")]
    pub reach_factor: f64,

    /// Re-synchronize each rule's schedule to the cadence of the snapshots
    /// it matches.
    /// Default: false
    #[serde(default)]
    pub auto_sync: bool,

    /// UTC offset for snapshot names without one, and for month arithmetic.
    /// Default: "+00:00"
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,

    /// Regex locating the timestamp inside each snapshot name. The first
    /// capture group is used if present, otherwise the whole match.
    #[serde(default)]
    pub extract_pattern: Option<String>,

    /// Schedule tiers, applied in order.
    /// Default: every 6h for 3 months, every day for 6 months, every week
    /// for 9 months.
    #[serde(default = "default_rules")]
    pub rules: Vec<ScheduleRule>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            reach_factor: default_reach_factor(),
            auto_sync: false,
            utc_offset: default_utc_offset(),
            extract_pattern: None,
            rules: default_rules(),
        }
    }
}

fn default_reach_factor() -> f64 {
    DEFAULT_REACH_FACTOR
}

fn default_utc_offset() -> String {
    "+00:00".to_string()
}

fn default_rules() -> Vec<ScheduleRule> {
    const HOUR: i64 = 3600;
    const DAY: i64 = 24 * HOUR;
    vec![
        ScheduleRule::new(CalendarSpan::from_seconds(6 * HOUR), CalendarSpan::from_months(3)),
        ScheduleRule::new(CalendarSpan::from_seconds(DAY), CalendarSpan::from_months(6)),
        ScheduleRule::new(CalendarSpan::from_seconds(7 * DAY), CalendarSpan::from_months(9)),
    ]
}

impl PolicyConfig {
    /// Check the policy for values the engine would reject.
    pub fn validate(&self) -> Result<(), String> {
        if !self.reach_factor.is_finite() || self.reach_factor < 0.0 {
            return Err(format!(
                "policy.reach_factor must be a finite number >= 0, got {}",
                self.reach_factor
            ));
        }

        if self.rules.is_empty() {
            return Err("policy.rules must contain at least one rule".into());
        }

        for (i, rule) in self.rules.iter().enumerate() {
            if rule.every.is_zero() {
                return Err(format!("policy.rules[{i}].every must not be zero"));
            }
            if let Some(reach) = rule.reach_factor
                && (!reach.is_finite() || reach < 0.0)
            {
                return Err(format!(
                    "policy.rules[{i}].reach_factor must be a finite number >= 0, got {reach}"
                ));
            }
        }

        self.offset()
            .map_err(|e| format!("policy.utc_offset: {e}"))?;
        self.extract_regex()?;

        Ok(())
    }

    /// The configured UTC offset.
    pub fn offset(&self) -> Result<FixedOffset, InstantError> {
        parse_offset(&self.utc_offset)
    }

    fn extract_regex(&self) -> Result<Option<Regex>, String> {
        self.extract_pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| format!("policy.extract_pattern: {e}"))
            })
            .transpose()
    }

    /// Build the timestamp parser for snapshot names.
    pub fn parser(&self) -> Result<TimestampParser, String> {
        let offset = self
            .offset()
            .map_err(|e| format!("policy.utc_offset: {e}"))?;
        let parser = TimestampParser::new(offset);
        Ok(match self.extract_regex()? {
            Some(pattern) => parser.with_extract(pattern),
            None => parser,
        })
    }

    /// Resolve every rule against `reference` and build the engine.
    pub fn engine(&self, reference: i64) -> Result<RetentionEngine, ScheduleError> {
        let offset = self.offset()?;
        let config = EngineConfig::new(reference)
            .with_reach_factor(self.reach_factor)
            .with_auto_sync(self.auto_sync);

        let rules = self
            .rules
            .iter()
            .map(|rule| rule.resolve(reference, offset))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RetentionEngine::with_rules(config, rules)?)
    }
}
