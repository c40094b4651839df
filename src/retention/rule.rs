//! Retention rules: one tier of a retention schedule.

use super::RetentionError;

/// How a rule steps backward from the reference instant.
#[derive(Debug, Clone, PartialEq)]
pub enum Stepping {
    /// Fixed-size windows, in seconds.
    Uniform { interval: i64, span: i64 },
    /// Window edges resolved ahead of time (calendar units), newest first.
    ///
    /// The first edge is the reference instant; window `k` spans
    /// `edges[k + 1]..edges[k]`.
    Edges(Vec<i64>),
}

/// One tier of a retention schedule.
///
/// A rule keeps at most one candidate per window while walking backward from
/// the reference instant until its span is exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionRule {
    stepping: Stepping,
    reach_factor: Option<f64>,
}

impl RetentionRule {
    /// Create a rule with a fixed interval and span, both in seconds.
    pub fn new(interval: i64, span: i64) -> Result<Self, RetentionError> {
        let rule = Self {
            stepping: Stepping::Uniform { interval, span },
            reach_factor: None,
        };
        rule.validate()?;
        Ok(rule)
    }

    /// Create a rule from pre-resolved window edges.
    ///
    /// Edges must be strictly descending; the first one is expected to be
    /// the reference instant the rule will be walked from.
    pub fn from_edges(edges: Vec<i64>) -> Result<Self, RetentionError> {
        let rule = Self {
            stepping: Stepping::Edges(edges),
            reach_factor: None,
        };
        rule.validate()?;
        Ok(rule)
    }

    /// Override the engine's default reach factor for this rule.
    pub fn with_reach_factor(mut self, reach_factor: f64) -> Result<Self, RetentionError> {
        self.reach_factor = Some(reach_factor);
        self.validate()?;
        Ok(self)
    }

    pub fn stepping(&self) -> &Stepping {
        &self.stepping
    }

    /// The per-rule reach factor override, if any.
    pub fn reach_factor(&self) -> Option<f64> {
        self.reach_factor
    }

    /// The reach factor this rule walks with, given the engine default.
    pub fn effective_reach_factor(&self, default: f64) -> f64 {
        self.reach_factor.unwrap_or(default)
    }

    /// Check the rule's invariants.
    pub fn validate(&self) -> Result<(), RetentionError> {
        match &self.stepping {
            Stepping::Uniform { interval, span } => {
                if *interval <= 0 {
                    return Err(RetentionError::InvalidRule(format!(
                        "interval must be positive, got {interval}s"
                    )));
                }
                if *span < 0 {
                    return Err(RetentionError::InvalidRule(format!(
                        "span must not be negative, got {span}s"
                    )));
                }
            }
            Stepping::Edges(edges) => {
                if edges.is_empty() {
                    return Err(RetentionError::InvalidRule(
                        "explicit edges must include the reference instant".into(),
                    ));
                }
                if let Some(pair) = edges.windows(2).find(|pair| pair[1] >= pair[0]) {
                    return Err(RetentionError::InvalidRule(format!(
                        "window edges must be strictly descending, found {} then {}",
                        pair[0], pair[1]
                    )));
                }
            }
        }

        if let Some(reach) = self.reach_factor {
            validate_reach_factor(reach)?;
        }

        Ok(())
    }

    /// Check that the rule can be walked from `reference`.
    pub fn check_reference(&self, reference: i64) -> Result<(), RetentionError> {
        if let Stepping::Edges(edges) = &self.stepping
            && edges.first() != Some(&reference)
        {
            return Err(RetentionError::InvalidRule(format!(
                "explicit edges start at {:?} but the reference instant is {reference}",
                edges.first()
            )));
        }
        Ok(())
    }

    /// The window edges this rule walks, starting at `reference`.
    ///
    /// Yields `reference` first and ends with the older edge of the last
    /// window whose recent edge is still inside the span. Call
    /// [`check_reference`](Self::check_reference) first for rules built from
    /// explicit edges.
    pub fn edges(&self, reference: i64) -> Edges<'_> {
        match &self.stepping {
            Stepping::Uniform { interval, span } => Edges::Uniform {
                next: Some(reference),
                interval: *interval,
                horizon: reference.saturating_sub(*span),
            },
            Stepping::Edges(edges) => Edges::Explicit(edges.iter()),
        }
    }

    /// Number of windows this rule walks.
    pub fn window_count(&self) -> usize {
        match &self.stepping {
            Stepping::Uniform { interval, span } => {
                let whole = span / interval;
                let windows = if span % interval == 0 { whole } else { whole + 1 };
                usize::try_from(windows).unwrap_or(usize::MAX)
            }
            Stepping::Edges(edges) => edges.len().saturating_sub(1),
        }
    }
}

/// Iterator over a rule's window edges, newest first.
#[derive(Debug, Clone)]
pub enum Edges<'a> {
    Uniform {
        next: Option<i64>,
        interval: i64,
        horizon: i64,
    },
    Explicit(std::slice::Iter<'a, i64>),
}

impl Iterator for Edges<'_> {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        match self {
            Self::Uniform {
                next,
                interval,
                horizon,
            } => {
                let current = (*next)?;
                *next = if current > *horizon {
                    current.checked_sub(*interval)
                } else {
                    None
                };
                Some(current)
            }
            Self::Explicit(edges) => edges.next().copied(),
        }
    }
}

pub(crate) fn validate_reach_factor(reach: f64) -> Result<(), RetentionError> {
    if !reach.is_finite() || reach < 0.0 {
        return Err(RetentionError::InvalidRule(format!(
            "reach factor must be a finite number >= 0, got {reach}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3600;
    const DAY: i64 = 24 * HOUR;

    #[test]
    fn test_rejects_non_positive_interval() {
        assert!(matches!(
            RetentionRule::new(0, DAY),
            Err(RetentionError::InvalidRule(_))
        ));
        assert!(matches!(
            RetentionRule::new(-HOUR, DAY),
            Err(RetentionError::InvalidRule(_))
        ));
    }

    #[test]
    fn test_rejects_negative_span() {
        assert!(RetentionRule::new(HOUR, -1).is_err());
    }

    #[test]
    fn test_rejects_bad_reach_factor() {
        let rule = RetentionRule::new(HOUR, DAY).unwrap();
        assert!(rule.clone().with_reach_factor(-0.1).is_err());
        assert!(rule.clone().with_reach_factor(f64::NAN).is_err());
        assert!(rule.with_reach_factor(0.0).is_ok());
    }

    #[test]
    fn test_uniform_edges_cover_span() {
        let rule = RetentionRule::new(DAY, 10 * DAY).unwrap();
        let edges: Vec<i64> = rule.edges(100 * DAY).collect();
        assert_eq!(edges.len(), 11);
        assert_eq!(edges[0], 100 * DAY);
        assert_eq!(edges[10], 90 * DAY);
        assert_eq!(rule.window_count(), 10);
    }

    #[test]
    fn test_uneven_span_rounds_window_count_up() {
        let rule = RetentionRule::new(DAY, 36 * HOUR).unwrap();
        assert_eq!(rule.window_count(), 2);
        assert_eq!(rule.edges(0).count(), 3);
    }

    #[test]
    fn test_zero_span_has_no_windows() {
        let rule = RetentionRule::new(DAY, 0).unwrap();
        assert_eq!(rule.window_count(), 0);
        assert_eq!(rule.edges(0).collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_interval_larger_than_span_yields_one_window() {
        let rule = RetentionRule::new(7 * DAY, DAY).unwrap();
        assert_eq!(rule.edges(0).collect::<Vec<_>>(), vec![0, -7 * DAY]);
    }

    #[test]
    fn test_explicit_edges_must_descend() {
        assert!(RetentionRule::from_edges(vec![10, 5, 5]).is_err());
        assert!(RetentionRule::from_edges(vec![]).is_err());
        assert!(RetentionRule::from_edges(vec![10, 5, 0]).is_ok());
    }

    #[test]
    fn test_explicit_edges_must_start_at_reference() {
        let rule = RetentionRule::from_edges(vec![10, 5, 0]).unwrap();
        assert!(rule.check_reference(10).is_ok());
        assert!(rule.check_reference(11).is_err());
        assert_eq!(rule.edges(10).collect::<Vec<_>>(), vec![10, 5, 0]);
        assert_eq!(rule.window_count(), 2);
    }
}
