//! Calendar-aware retention schedules.
//!
//! Rules in a policy file are written in human units (`"6h"`, `"3mo"`,
//! `"1y"`). Months and years have no fixed length, so rules using them are
//! resolved against the reference instant into explicit window edges, one
//! calendar subtraction per edge. Rules in plain seconds resolve to uniform
//! windows.

use std::{fmt, str::FromStr};

use chrono::{FixedOffset, Months, TimeZone};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    instant::InstantError,
    retention::{RetentionError, RetentionRule},
};

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;

/// Upper bound on the number of windows a calendar rule may resolve to.
pub const MAX_CALENDAR_WINDOWS: usize = 1_000_000;

static SPAN_PART: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*(\d+)\s*([a-z]+)\s*").expect("span pattern is a valid regex")
});

/// Errors from parsing or resolving schedules.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid duration {0:?}: {1}")]
    InvalidSpan(String, String),

    #[error("Calendar arithmetic out of range: {0}")]
    OutOfRange(String),

    #[error("Rule resolves to more than {0} windows")]
    TooManyWindows(usize),

    #[error(transparent)]
    Offset(#[from] InstantError),

    #[error(transparent)]
    Rule(#[from] RetentionError),
}

/// A duration made of calendar months plus a fixed number of seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CalendarSpan {
    pub months: u32,
    pub seconds: i64,
}

impl CalendarSpan {
    pub const fn from_seconds(seconds: i64) -> Self {
        Self { months: 0, seconds }
    }

    pub const fn from_months(months: u32) -> Self {
        Self { months, seconds: 0 }
    }

    pub fn is_zero(&self) -> bool {
        self.months == 0 && self.seconds == 0
    }

    /// True when the span has the same length wherever it is applied.
    pub fn is_fixed(&self) -> bool {
        self.months == 0
    }

    /// This span repeated `count` times.
    pub fn times(&self, count: u32) -> Option<Self> {
        Some(Self {
            months: self.months.checked_mul(count)?,
            seconds: self.seconds.checked_mul(i64::from(count))?,
        })
    }

    /// The instant this span before `instant`, with month arithmetic done on
    /// the wall clock at `offset`.
    ///
    /// Days past the end of the target month clamp to its last day.
    pub fn before(&self, instant: i64, offset: FixedOffset) -> Result<i64, ScheduleError> {
        let out_of_range = || ScheduleError::OutOfRange(format!("{self} before {instant}"));

        let start = offset
            .timestamp_opt(instant, 0)
            .single()
            .ok_or_else(out_of_range)?;
        let shifted = if self.months > 0 {
            start
                .checked_sub_months(Months::new(self.months))
                .ok_or_else(out_of_range)?
        } else {
            start
        };
        shifted
            .timestamp()
            .checked_sub(self.seconds)
            .ok_or_else(out_of_range)
    }
}

impl FromStr for CalendarSpan {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ScheduleError::InvalidSpan(s.to_string(), reason.to_string());

        if s.trim().is_empty() {
            return Err(invalid("empty duration"));
        }

        let mut span = CalendarSpan::default();
        let mut consumed = 0;

        for caps in SPAN_PART.captures_iter(s) {
            let whole = caps.get(0).ok_or_else(|| invalid("malformed duration"))?;
            if whole.start() != consumed {
                return Err(invalid("unexpected characters"));
            }
            consumed = whole.end();

            let amount: u32 = caps[1]
                .parse()
                .map_err(|_| invalid("amount is too large"))?;
            let unit = caps[2].to_ascii_lowercase();

            match unit.as_str() {
                "mo" | "mon" | "month" | "months" => {
                    span.months = span
                        .months
                        .checked_add(amount)
                        .ok_or_else(|| invalid("too many months"))?;
                }
                "y" | "yr" | "year" | "years" => {
                    span.months = amount
                        .checked_mul(12)
                        .and_then(|m| span.months.checked_add(m))
                        .ok_or_else(|| invalid("too many years"))?;
                }
                other => {
                    let unit_seconds = match other {
                        "s" | "sec" | "secs" | "second" | "seconds" => 1,
                        "m" | "min" | "mins" | "minute" | "minutes" => MINUTE,
                        "h" | "hr" | "hrs" | "hour" | "hours" => HOUR,
                        "d" | "day" | "days" => DAY,
                        "w" | "wk" | "week" | "weeks" => WEEK,
                        _ => return Err(invalid(&format!("unknown unit {other:?}"))),
                    };
                    span.seconds = i64::from(amount)
                        .checked_mul(unit_seconds)
                        .and_then(|secs| span.seconds.checked_add(secs))
                        .ok_or_else(|| invalid("too many seconds"))?;
                }
            }
        }

        if consumed != s.len() {
            return Err(invalid("unexpected characters"));
        }

        Ok(span)
    }
}

impl TryFrom<String> for CalendarSpan {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CalendarSpan> for String {
    fn from(span: CalendarSpan) -> Self {
        span.to_string()
    }
}

impl fmt::Display for CalendarSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return write!(f, "0s");
        }

        let (years, months) = (self.months / 12, self.months % 12);
        if years > 0 {
            write!(f, "{years}y")?;
        }
        if months > 0 {
            write!(f, "{months}mo")?;
        }

        let mut rest = self.seconds;
        for (unit, size) in [("w", WEEK), ("d", DAY), ("h", HOUR), ("m", MINUTE), ("s", 1)] {
            let count = rest / size;
            if count > 0 {
                write!(f, "{count}{unit}")?;
                rest -= count * size;
            }
        }
        Ok(())
    }
}

/// A retention rule as written in a policy file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleRule {
    /// Spacing between kept snapshots (e.g. `"6h"`, `"1w"`, `"1mo"`).
    pub every: CalendarSpan,

    /// How far back from the reference this rule applies (e.g. `"3mo"`).
    pub keep_for: CalendarSpan,

    /// Per-rule search radius multiplier. Falls back to the policy default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reach_factor: Option<f64>,
}

impl ScheduleRule {
    pub fn new(every: CalendarSpan, keep_for: CalendarSpan) -> Self {
        Self {
            every,
            keep_for,
            reach_factor: None,
        }
    }

    /// Resolve into an engine rule walked from `reference`.
    pub fn resolve(
        &self,
        reference: i64,
        offset: FixedOffset,
    ) -> Result<RetentionRule, ScheduleError> {
        if self.every.is_zero() || self.every.seconds < 0 || self.keep_for.seconds < 0 {
            return Err(RetentionError::InvalidRule(format!(
                "every = {:?}, keep_for = {:?} must both be positive durations",
                self.every.to_string(),
                self.keep_for.to_string()
            ))
            .into());
        }

        let rule = if self.every.is_fixed() && self.keep_for.is_fixed() {
            RetentionRule::new(self.every.seconds, self.keep_for.seconds)?
        } else {
            RetentionRule::from_edges(self.calendar_edges(reference, offset)?)?
        };

        match self.reach_factor {
            Some(reach) => Ok(rule.with_reach_factor(reach)?),
            None => Ok(rule),
        }
    }

    fn calendar_edges(
        &self,
        reference: i64,
        offset: FixedOffset,
    ) -> Result<Vec<i64>, ScheduleError> {
        let horizon = self.keep_for.before(reference, offset)?;
        let mut edges = vec![reference];
        let mut epoch = reference;
        let mut step: u32 = 1;

        while epoch > horizon {
            if edges.len() > MAX_CALENDAR_WINDOWS {
                return Err(ScheduleError::TooManyWindows(MAX_CALENDAR_WINDOWS));
            }
            // Offsets are taken from the reference each time so month-end
            // clamping never accumulates across steps.
            let stride = self
                .every
                .times(step)
                .ok_or_else(|| ScheduleError::OutOfRange(format!("{} x {step}", self.every)))?;
            epoch = stride.before(reference, offset)?;
            edges.push(epoch);
            step += 1;
        }

        Ok(edges)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rstest::rstest;

    use super::*;
    use crate::{instant::utc, retention::Stepping};

    fn at(y: i32, m: u32, d: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap().timestamp()
    }

    #[rstest]
    #[case::seconds("45s", CalendarSpan::from_seconds(45))]
    #[case::minutes("30min", CalendarSpan::from_seconds(30 * MINUTE))]
    #[case::short_minutes("5m", CalendarSpan::from_seconds(5 * MINUTE))]
    #[case::hours("6h", CalendarSpan::from_seconds(6 * HOUR))]
    #[case::days("1d", CalendarSpan::from_seconds(DAY))]
    #[case::weeks("2w", CalendarSpan::from_seconds(2 * WEEK))]
    #[case::months("3mo", CalendarSpan::from_months(3))]
    #[case::years("1y", CalendarSpan::from_months(12))]
    #[case::words("2 weeks", CalendarSpan::from_seconds(2 * WEEK))]
    #[case::mixed("1y6mo", CalendarSpan::from_months(18))]
    #[case::mixed_fixed("1d12h", CalendarSpan::from_seconds(DAY + 12 * HOUR))]
    #[case::upper("3MO", CalendarSpan::from_months(3))]
    #[case::month_and_days("1mo 2d", CalendarSpan { months: 1, seconds: 2 * DAY })]
    fn test_parse_span(#[case] input: &str, #[case] expected: CalendarSpan) {
        assert_eq!(input.parse::<CalendarSpan>().unwrap(), expected);
    }

    #[rstest]
    #[case::empty("")]
    #[case::no_unit("12")]
    #[case::unknown_unit("3 fortnights")]
    #[case::trailing_garbage("3d!")]
    #[case::leading_garbage("about 3d")]
    #[case::negative("-3d")]
    fn test_parse_span_rejects(#[case] input: &str) {
        assert!(matches!(
            input.parse::<CalendarSpan>(),
            Err(ScheduleError::InvalidSpan(..))
        ));
    }

    #[rstest]
    #[case("6h")]
    #[case("1y6mo")]
    #[case("1w2d")]
    #[case("1mo1d3h")]
    fn test_display_parses_back(#[case] input: &str) {
        let span: CalendarSpan = input.parse().unwrap();
        assert_eq!(span.to_string().parse::<CalendarSpan>().unwrap(), span);
    }

    #[test]
    fn test_before_clamps_to_month_end() {
        let span = CalendarSpan::from_months(1);
        assert_eq!(span.before(at(2018, 3, 31), utc()).unwrap(), at(2018, 2, 28));
    }

    #[test]
    fn test_before_applies_months_then_seconds() {
        let span = CalendarSpan {
            months: 1,
            seconds: DAY,
        };
        assert_eq!(span.before(at(2018, 3, 1), utc()).unwrap(), at(2018, 1, 31));
    }

    #[test]
    fn test_fixed_rule_resolves_uniform() {
        let rule = ScheduleRule::new(
            CalendarSpan::from_seconds(DAY),
            CalendarSpan::from_seconds(10 * DAY),
        )
        .resolve(at(2018, 1, 1), utc())
        .unwrap();
        assert_eq!(
            rule.stepping(),
            &Stepping::Uniform {
                interval: DAY,
                span: 10 * DAY
            }
        );
    }

    #[test]
    fn test_monthly_rule_resolves_month_starts() {
        let reference = at(2018, 7, 1);
        let rule = ScheduleRule::new(CalendarSpan::from_months(1), CalendarSpan::from_months(6))
            .resolve(reference, utc())
            .unwrap();
        let edges: Vec<i64> = rule.edges(reference).collect();
        let expected: Vec<i64> = (1..=7).rev().map(|m| at(2018, m, 1)).collect();
        assert_eq!(edges, expected);
        assert_eq!(rule.window_count(), 6);
    }

    #[test]
    fn test_month_end_reference_does_not_drift() {
        let reference = at(2018, 8, 31);
        let rule = ScheduleRule::new(CalendarSpan::from_months(1), CalendarSpan::from_months(3))
            .resolve(reference, utc())
            .unwrap();
        let edges: Vec<i64> = rule.edges(reference).collect();
        assert_eq!(
            edges,
            vec![reference, at(2018, 7, 31), at(2018, 6, 30), at(2018, 5, 31)]
        );
    }

    #[test]
    fn test_fixed_interval_with_calendar_span() {
        let reference = at(2018, 3, 1);
        let rule = ScheduleRule::new(CalendarSpan::from_seconds(WEEK), CalendarSpan::from_months(1))
            .resolve(reference, utc())
            .unwrap();
        // February 2018 is exactly four weeks long.
        assert_eq!(rule.window_count(), 4);
    }

    #[test]
    fn test_resolve_applies_reach_factor() {
        let mut schedule = ScheduleRule::new(
            CalendarSpan::from_seconds(HOUR),
            CalendarSpan::from_seconds(DAY),
        );
        schedule.reach_factor = Some(0.9);
        let rule = schedule.resolve(0, utc()).unwrap();
        assert_eq!(rule.reach_factor(), Some(0.9));

        schedule.reach_factor = Some(-1.0);
        assert!(matches!(
            schedule.resolve(0, utc()),
            Err(ScheduleError::Rule(RetentionError::InvalidRule(_)))
        ));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let schedule = ScheduleRule::new(CalendarSpan::default(), CalendarSpan::from_months(1));
        assert!(matches!(
            schedule.resolve(0, utc()),
            Err(ScheduleError::Rule(RetentionError::InvalidRule(_)))
        ));
    }

    #[test]
    fn test_too_many_calendar_windows_is_rejected() {
        let schedule = ScheduleRule::new("1s".parse().unwrap(), "1y".parse().unwrap());
        assert_eq!(
            schedule.resolve(at(2018, 1, 1), utc()),
            Err(ScheduleError::TooManyWindows(MAX_CALENDAR_WINDOWS))
        );
    }

    #[test]
    fn test_deserialize_rule() {
        let rule: ScheduleRule = toml::from_str(
            r#"
            every = "6h"
            keep_for = "3mo"
            reach_factor = 0.75
        "#,
        )
        .unwrap();
        assert_eq!(rule.every, CalendarSpan::from_seconds(6 * HOUR));
        assert_eq!(rule.keep_for, CalendarSpan::from_months(3));
        assert_eq!(rule.reach_factor, Some(0.75));
    }

    #[test]
    fn test_deserialize_rejects_bad_span() {
        let result: Result<ScheduleRule, _> = toml::from_str(
            r#"
            every = "6 lightyears"
            keep_for = "3mo"
        "#,
        );
        assert!(result.is_err());
    }
}
