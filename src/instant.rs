//! Timestamp coercion.
//!
//! Converts the different ways a snapshot time can be written (epoch
//! seconds, chrono date-times, free text) into seconds since the Unix epoch,
//! the only representation the retention engine works with.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use regex::Regex;

/// Naive date-time layouts accepted in text form, tried in order.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y%m%dT%H%M%S",
    "%Y%m%d-%H%M%S",
    "%Y%m%d_%H%M%S",
    "%Y%m%d%H%M%S",
];

/// Date-only layouts; these resolve to midnight.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y%m%d"];

/// Errors from timestamp coercion.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InstantError {
    #[error("Unrecognized timestamp: {0:?}")]
    Unparseable(String),

    #[error("Timestamp out of range: {0}")]
    OutOfRange(String),
}

/// A timestamp in any of its supported representations.
#[derive(Debug, Clone, PartialEq)]
pub enum TimestampInput {
    /// Seconds since the Unix epoch.
    Numeric(i64),
    /// A calendar date-time with an explicit offset.
    Structured(DateTime<FixedOffset>),
    /// Free text, parsed as UTC when it carries no offset.
    Text(String),
}

/// Anything that can be resolved to seconds since the Unix epoch.
pub trait ToInstant {
    fn to_instant(&self) -> Result<i64, InstantError>;
}

impl ToInstant for i64 {
    fn to_instant(&self) -> Result<i64, InstantError> {
        Ok(*self)
    }
}

impl<Tz: TimeZone> ToInstant for DateTime<Tz> {
    fn to_instant(&self) -> Result<i64, InstantError> {
        Ok(self.timestamp())
    }
}

impl ToInstant for str {
    fn to_instant(&self) -> Result<i64, InstantError> {
        TimestampParser::default().parse(self)
    }
}

impl ToInstant for String {
    fn to_instant(&self) -> Result<i64, InstantError> {
        self.as_str().to_instant()
    }
}

impl ToInstant for TimestampInput {
    fn to_instant(&self) -> Result<i64, InstantError> {
        match self {
            Self::Numeric(seconds) => Ok(*seconds),
            Self::Structured(datetime) => datetime.to_instant(),
            Self::Text(text) => text.to_instant(),
        }
    }
}

impl<T: ToInstant + ?Sized> ToInstant for &T {
    fn to_instant(&self) -> Result<i64, InstantError> {
        (**self).to_instant()
    }
}

/// Parses text timestamps, optionally pulling them out of longer names.
#[derive(Debug, Clone)]
pub struct TimestampParser {
    offset: FixedOffset,
    extract: Option<Regex>,
}

impl Default for TimestampParser {
    fn default() -> Self {
        Self {
            offset: utc(),
            extract: None,
        }
    }
}

impl TimestampParser {
    /// Parser that reads naive date-times in `offset`.
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            offset,
            extract: None,
        }
    }

    /// Only parse the part of each name matched by `pattern`.
    ///
    /// The first capture group is used when the pattern has one, otherwise
    /// the whole match.
    pub fn with_extract(mut self, pattern: Regex) -> Self {
        self.extract = Some(pattern);
        self
    }

    /// Resolve a snapshot name or timestamp to a [`TimestampInput`].
    pub fn input(&self, name: &str) -> Result<TimestampInput, InstantError> {
        let text = self.extract_from(name)?;

        if let Some(seconds) = parse_epoch(text)? {
            return Ok(TimestampInput::Numeric(seconds));
        }

        if let Ok(datetime) = DateTime::parse_from_rfc3339(text) {
            return Ok(TimestampInput::Structured(datetime));
        }

        self.parse_naive(text)
            .map(TimestampInput::Structured)
            .ok_or_else(|| InstantError::Unparseable(text.to_string()))
    }

    /// Resolve a snapshot name or timestamp straight to epoch seconds.
    pub fn parse(&self, name: &str) -> Result<i64, InstantError> {
        self.input(name)?.to_instant()
    }

    fn extract_from<'a>(&self, name: &'a str) -> Result<&'a str, InstantError> {
        let Some(pattern) = &self.extract else {
            return Ok(name.trim());
        };
        let captures = pattern
            .captures(name)
            .ok_or_else(|| InstantError::Unparseable(name.to_string()))?;
        let matched = captures
            .get(1)
            .or_else(|| captures.get(0))
            .ok_or_else(|| InstantError::Unparseable(name.to_string()))?;
        Ok(matched.as_str().trim())
    }

    fn parse_naive(&self, text: &str) -> Option<DateTime<FixedOffset>> {
        let naive = DATETIME_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
            .or_else(|| {
                DATE_FORMATS
                    .iter()
                    .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
            })?;
        self.offset.from_local_datetime(&naive).single()
    }
}

/// Parse plain epoch seconds, integer or fractional.
///
/// All-digit strings of 8 or 14 characters that form a valid compact date
/// (`YYYYMMDD`, `YYYYMMDDHHMMSS`) are left for the date parsers.
fn parse_epoch(text: &str) -> Result<Option<i64>, InstantError> {
    if text.is_empty() {
        return Err(InstantError::Unparseable(String::new()));
    }

    let digits = text.strip_prefix('-').unwrap_or(text);
    if digits.is_empty() {
        return Ok(None);
    }

    if digits.chars().all(|c| c.is_ascii_digit()) {
        if looks_like_compact_date(text) {
            return Ok(None);
        }
        return text
            .parse::<i64>()
            .map(Some)
            .map_err(|_| InstantError::OutOfRange(text.to_string()));
    }

    if digits.chars().all(|c| c.is_ascii_digit() || c == '.') && digits.matches('.').count() == 1 {
        let seconds: f64 = text
            .parse()
            .map_err(|_| InstantError::Unparseable(text.to_string()))?;
        if !seconds.is_finite() || seconds.abs() >= i64::MAX as f64 {
            return Err(InstantError::OutOfRange(text.to_string()));
        }
        return Ok(Some(seconds.floor() as i64));
    }

    Ok(None)
}

fn looks_like_compact_date(text: &str) -> bool {
    match text.len() {
        8 => NaiveDate::parse_from_str(text, "%Y%m%d").is_ok(),
        14 => NaiveDateTime::parse_from_str(text, "%Y%m%d%H%M%S").is_ok(),
        _ => false,
    }
}

/// Parse a UTC offset such as `+02:00`, `-0530`, `Z` or `UTC`.
pub fn parse_offset(text: &str) -> Result<FixedOffset, InstantError> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("utc") || trimmed.eq_ignore_ascii_case("z") {
        return Ok(utc());
    }

    let (sign, rest) = match trimmed.as_bytes().first() {
        Some(b'+') => (1, &trimmed[1..]),
        Some(b'-') => (-1, &trimmed[1..]),
        _ => return Err(InstantError::Unparseable(text.to_string())),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(InstantError::Unparseable(text.to_string()));
    }
    let hours: i32 = digits[..2]
        .parse()
        .map_err(|_| InstantError::Unparseable(text.to_string()))?;
    let minutes: i32 = digits[2..]
        .parse()
        .map_err(|_| InstantError::Unparseable(text.to_string()))?;
    if hours > 23 || minutes > 59 {
        return Err(InstantError::Unparseable(text.to_string()));
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| InstantError::OutOfRange(text.to_string()))
}

pub(crate) fn utc() -> FixedOffset {
    Utc.fix()
}
