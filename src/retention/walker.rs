//! The rule walker.
//!
//! Walks one rule's windows from the most recent to the oldest and marks the
//! single candidate nearest to each window's goal. Candidates must be sorted
//! by instant, ascending.

/// Multiplicative decay applied to the drift after every window.
pub(crate) const DRIFT_DECAY: f64 = 7.0 / 8.0;

/// One timestamp under consideration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub instant: i64,
    /// Position in the caller's list.
    pub original_index: usize,
    /// Only ever flips from `false` to `true`.
    pub keep: bool,
}

impl Candidate {
    pub(crate) fn new(instant: i64, original_index: usize) -> Self {
        Self {
            instant,
            original_index,
            keep: false,
        }
    }
}

/// Summary of a single rule walk, for logging.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub(crate) struct WalkSummary {
    pub windows: usize,
    pub matches: usize,
    pub final_drift: f64,
}

/// Mark the best candidate of every window described by `edges`.
///
/// `edges` is descending; each consecutive pair is one window, recent edge
/// first.
pub(crate) fn walk(
    candidates: &mut [Candidate],
    edges: impl IntoIterator<Item = i64>,
    reach_factor: f64,
    auto_sync: bool,
) -> WalkSummary {
    let mut summary = WalkSummary::default();
    let mut drift = 0.0_f64;
    // Candidates at indices below `floor` are still open for claiming.
    let mut floor = candidates.len();

    let mut edges = edges.into_iter();
    let Some(mut recent) = edges.next() else {
        return summary;
    };

    for older in edges {
        if floor == 0 {
            break;
        }

        let epoch = recent as f64;
        let next_epoch = older as f64;
        let radius = (epoch - next_epoch) / 2.0 * reach_factor;
        let goal = (epoch + next_epoch) / 2.0 + drift;
        let retire_above = next_epoch + drift + radius;
        summary.windows += 1;

        let mut best: Option<(usize, f64)> = None;
        let mut next_floor = floor;

        for idx in (0..floor).rev() {
            let instant = candidates[idx].instant as f64;
            if instant < goal - radius {
                break;
            }
            if instant <= goal + radius {
                let distance = (instant - goal).abs();
                // Strict comparison: on ties the more recent candidate wins.
                if best.is_none_or(|(_, closest)| distance < closest) {
                    best = Some((idx, distance));
                }
            }
            if instant > retire_above {
                next_floor = idx;
            }
        }

        if let Some((idx, _)) = best {
            let matched = &mut candidates[idx];
            matched.keep = true;
            summary.matches += 1;
            next_floor = next_floor.min(idx);

            if auto_sync {
                drift += (matched.instant as f64 - goal) / 2.0;
            }

            tracing::trace!(
                window_start = older,
                window_end = recent,
                goal,
                radius,
                instant = matched.instant,
                "Window matched"
            );
        }

        floor = next_floor;
        if drift != 0.0 {
            drift = (drift * DRIFT_DECAY).trunc();
        }
        recent = older;
    }

    summary.final_drift = drift;
    summary
}
