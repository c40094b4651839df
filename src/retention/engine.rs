//! Retention engine: orders candidates, walks every rule over them, and
//! splits the caller's list into kept and discarded elements.

use std::fmt::Display;

use super::{
    RetentionError,
    rule::{RetentionRule, validate_reach_factor},
    walker::{self, Candidate},
};
use crate::instant::ToInstant;

/// Reach factor used by rules that don't set their own.
pub const DEFAULT_REACH_FACTOR: f64 = 0.5;

/// Engine configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// Instant (seconds since epoch) every rule steps backward from.
    pub reference: i64,
    /// Search-radius multiplier for rules without an override.
    /// Default: 0.5
    pub default_reach_factor: f64,
    /// Shift later goals toward the cadence of matched candidates.
    /// Default: false
    pub auto_sync: bool,
}

impl EngineConfig {
    /// Configuration with default reach factor and auto-sync off.
    pub fn new(reference: i64) -> Self {
        Self {
            reference,
            default_reach_factor: DEFAULT_REACH_FACTOR,
            auto_sync: false,
        }
    }

    pub fn with_reach_factor(mut self, reach_factor: f64) -> Self {
        self.default_reach_factor = reach_factor;
        self
    }

    pub fn with_auto_sync(mut self, auto_sync: bool) -> Self {
        self.auto_sync = auto_sync;
        self
    }
}

/// Partitions timestamps into keepers and discards according to a set of
/// retention rules.
///
/// The engine holds no state between calls; `partition` and `mark` only
/// read the configuration and rules, so a shared engine can be used from
/// several threads at once.
#[derive(Debug, Clone)]
pub struct RetentionEngine {
    config: EngineConfig,
    rules: Vec<RetentionRule>,
}

impl RetentionEngine {
    /// Create an engine with no rules.
    pub fn new(config: EngineConfig) -> Result<Self, RetentionError> {
        validate_reach_factor(config.default_reach_factor)?;
        Ok(Self {
            config,
            rules: Vec::new(),
        })
    }

    /// Create an engine with the given rules, validating each one.
    pub fn with_rules(
        config: EngineConfig,
        rules: impl IntoIterator<Item = RetentionRule>,
    ) -> Result<Self, RetentionError> {
        let mut engine = Self::new(config)?;
        for rule in rules {
            engine.add_rule(rule)?;
        }
        Ok(engine)
    }

    /// Register another rule. Rules are walked in registration order.
    pub fn add_rule(&mut self, rule: RetentionRule) -> Result<(), RetentionError> {
        rule.validate()?;
        self.rules.push(rule);
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rules(&self) -> &[RetentionRule] {
        &self.rules
    }

    /// Compute keep flags for already-resolved instants.
    ///
    /// The returned vector is indexed like `instants`.
    pub fn mark(&self, instants: &[i64]) -> Result<Vec<bool>, RetentionError> {
        validate_reach_factor(self.config.default_reach_factor)?;
        // Check every rule before touching any candidate so a bad rule can't
        // leave a half-marked list behind.
        for rule in &self.rules {
            rule.validate()?;
            rule.check_reference(self.config.reference)?;
        }

        let mut candidates = order_candidates(instants);

        for (position, rule) in self.rules.iter().enumerate() {
            let reach = rule.effective_reach_factor(self.config.default_reach_factor);
            let summary = walker::walk(
                &mut candidates,
                rule.edges(self.config.reference),
                reach,
                self.config.auto_sync,
            );
            tracing::debug!(
                rule = position,
                reach_factor = reach,
                windows = summary.windows,
                matches = summary.matches,
                final_drift = summary.final_drift,
                "Rule walked"
            );
        }

        let mut keep = vec![false; instants.len()];
        for candidate in &candidates {
            keep[candidate.original_index] = candidate.keep;
        }
        Ok(keep)
    }

    /// Partition `items` in place using a caller-supplied coercion.
    ///
    /// After a successful call `items` holds only the kept elements and the
    /// discarded ones are returned, both in their original relative order.
    /// On error `items` is left untouched.
    pub fn partition_by<T, F, E>(
        &self,
        items: &mut Vec<T>,
        mut instant_of: F,
    ) -> Result<Vec<T>, RetentionError>
    where
        F: FnMut(&T) -> Result<i64, E>,
        E: Display,
    {
        let instants = items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                instant_of(item).map_err(|e| RetentionError::InvalidTimestamp {
                    index,
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let keep = self.mark(&instants)?;

        let mut kept = Vec::with_capacity(items.len());
        let mut discarded = Vec::new();
        for (item, keep) in std::mem::take(items).into_iter().zip(keep) {
            if keep {
                kept.push(item);
            } else {
                discarded.push(item);
            }
        }

        tracing::debug!(
            kept = kept.len(),
            discarded = discarded.len(),
            reference = self.config.reference,
            "Partition complete"
        );

        *items = kept;
        Ok(discarded)
    }

    /// Partition `items` in place, coercing each with [`ToInstant`].
    pub fn partition<T: ToInstant>(&self, items: &mut Vec<T>) -> Result<Vec<T>, RetentionError> {
        self.partition_by(items, |item| item.to_instant())
    }
}

/// Partition `candidates` in place with a one-off engine.
///
/// Returns the discarded elements; `candidates` keeps the rest.
pub fn partition<T: ToInstant>(
    candidates: &mut Vec<T>,
    rules: &[RetentionRule],
    reference: i64,
    default_reach_factor: f64,
    auto_sync: bool,
) -> Result<Vec<T>, RetentionError> {
    let config = EngineConfig::new(reference)
        .with_reach_factor(default_reach_factor)
        .with_auto_sync(auto_sync);
    RetentionEngine::with_rules(config, rules.iter().cloned())?.partition(candidates)
}

/// Sort candidates ascending by instant. Equal instants keep input order.
fn order_candidates(instants: &[i64]) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = instants
        .iter()
        .enumerate()
        .map(|(index, &instant)| Candidate::new(instant, index))
        .collect();
    candidates.sort_by_key(|c| c.instant);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3600;
    const DAY: i64 = 24 * HOUR;

    fn daily_engine(reference: i64, days: i64) -> RetentionEngine {
        RetentionEngine::with_rules(
            EngineConfig::new(reference),
            [RetentionRule::new(DAY, days * DAY).unwrap()],
        )
        .unwrap()
    }

    #[test]
    fn test_order_candidates_is_stable() {
        let ordered = order_candidates(&[30, 10, 20, 10]);
        let pairs: Vec<(i64, usize)> = ordered
            .iter()
            .map(|c| (c.instant, c.original_index))
            .collect();
        assert_eq!(pairs, vec![(10, 1), (10, 3), (20, 2), (30, 0)]);
        assert!(ordered.iter().all(|c| !c.keep));
    }

    #[test]
    fn test_engine_rejects_negative_default_reach() {
        let config = EngineConfig::new(0).with_reach_factor(-1.0);
        assert!(matches!(
            RetentionEngine::new(config),
            Err(RetentionError::InvalidRule(_))
        ));
    }

    #[test]
    fn test_no_rules_discards_everything() {
        let engine = RetentionEngine::new(EngineConfig::new(10 * DAY)).unwrap();
        let mut items = vec![DAY, 2 * DAY, 3 * DAY];
        let discarded = engine.partition(&mut items).unwrap();
        assert!(items.is_empty());
        assert_eq!(discarded, vec![DAY, 2 * DAY, 3 * DAY]);
    }

    #[test]
    fn test_partition_keeps_original_order() {
        let reference = 10 * DAY;
        let engine = daily_engine(reference, 3);
        let keep_a = reference - 12 * HOUR;
        let keep_b = reference - 36 * HOUR;
        let mut items = vec![keep_b, reference - 20 * HOUR, keep_a, reference - 30 * DAY];
        let discarded = engine.partition(&mut items).unwrap();
        assert_eq!(items, vec![keep_b, keep_a]);
        assert_eq!(discarded, vec![reference - 20 * HOUR, reference - 30 * DAY]);
    }

    #[test]
    fn test_duplicate_instants_remain_distinct() {
        let reference = 10 * DAY;
        let engine = daily_engine(reference, 1);
        let goal = reference - 12 * HOUR;
        let mut items = vec![("a", goal), ("b", goal)];
        let discarded = engine
            .partition_by(&mut items, |(_, t)| Ok::<_, std::convert::Infallible>(*t))
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(discarded.len(), 1);
    }

    #[test]
    fn test_coercion_failure_leaves_input_untouched() {
        let engine = daily_engine(10 * DAY, 3);
        let mut items = vec!["1", "not a time", "3"];
        let err = engine
            .partition_by(&mut items, |s| s.parse::<i64>())
            .unwrap_err();
        assert!(matches!(
            err,
            RetentionError::InvalidTimestamp { index: 1, .. }
        ));
        assert_eq!(items, vec!["1", "not a time", "3"]);
    }

    #[test]
    fn test_rule_reach_override_applies() {
        let reference = 10 * DAY;
        let goal = reference - 12 * HOUR;
        // 9h away: outside the default 6h radius, inside a 0.8 reach (9.6h).
        let instant = goal - 9 * HOUR;

        let engine = daily_engine(reference, 1);
        assert_eq!(engine.mark(&[instant]).unwrap(), vec![false]);

        let wide = RetentionEngine::with_rules(
            EngineConfig::new(reference),
            [RetentionRule::new(DAY, DAY)
                .unwrap()
                .with_reach_factor(0.8)
                .unwrap()],
        )
        .unwrap();
        assert_eq!(wide.mark(&[instant]).unwrap(), vec![true]);
    }

    #[test]
    fn test_explicit_edges_must_match_reference() {
        let engine = RetentionEngine::with_rules(
            EngineConfig::new(100),
            [RetentionRule::from_edges(vec![90, 50, 10]).unwrap()],
        )
        .unwrap();
        assert!(matches!(
            engine.mark(&[60]),
            Err(RetentionError::InvalidRule(_))
        ));
    }

    #[test]
    fn test_free_function_matches_engine() {
        let reference = 10 * DAY;
        let rules = [RetentionRule::new(DAY, 3 * DAY).unwrap()];
        let mut items = vec![reference - 12 * HOUR, reference - 13 * HOUR];
        let discarded = partition(&mut items, &rules, reference, 0.5, false).unwrap();
        assert_eq!(items, vec![reference - 12 * HOUR]);
        assert_eq!(discarded, vec![reference - 13 * HOUR]);
    }
}
