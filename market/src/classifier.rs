//! Split-state classifier.
//!
//! The classifier is the one primitive every engine shares. It takes a
//! numeric series and answers, per split (a trailing fraction of the
//! series), how strongly the series is moving and in which direction.
//!
//! ## Per-split rule
//!
//! ```text
//! change = (last - first) / first * 100     // over the split's tail
//! change >=  strong_requirement → +2
//! change >=  requirement        → +1
//! change <= -strong_requirement → -2
//! change <= -requirement        → -1
//! otherwise                     →  0
//! ```
//!
//! ## Mean rule
//!
//! The eight per-split states (not their changes) are averaged and the
//! average is itself classified with fixed thresholds:
//! `>= 1.5 → 2`, `>= 0.75 → 1`, `<= -1.5 → -2`, `<= -0.75 → -1`, else 0.
//!
//! ## Degenerate input
//!
//! A sub-series shorter than 2 elements, an all-equal sub-series, or a
//! zero first element yields `change = 0`, `state = 0`. The classifier
//! never errors and performs no I/O.

use std::collections::BTreeMap;

use crate::types::{SplitId, SplitResult, State, StateResult};

/// Mean-of-splits classification thresholds.
pub const MEAN_REQUIREMENT: f64 = 0.75;
pub const MEAN_STRONG_REQUIREMENT: f64 = 1.5;

/// Classify a series at every split fraction.
///
/// `requirement_pct` must be smaller than `strong_requirement_pct`;
/// config validation enforces this before a classify call can happen.
pub fn classify(series: &[f64], requirement_pct: f64, strong_requirement_pct: f64) -> StateResult {
    let mut splits = BTreeMap::new();
    let mut sum: f64 = 0.0;

    for id in SplitId::ALL {
        let result = classify_split(series, id.fraction(), requirement_pct, strong_requirement_pct);
        sum += f64::from(result.state.value());
        splits.insert(id, result);
    }

    let mean = classify_mean(sum / SplitId::ALL.len() as f64);

    StateResult { mean, splits }
}

/// Classify the trailing `fraction` of the series.
fn classify_split(
    series: &[f64],
    fraction: f64,
    requirement_pct: f64,
    strong_requirement_pct: f64,
) -> SplitResult {
    let take = ((series.len() as f64) * fraction).ceil() as usize;
    let tail = &series[series.len().saturating_sub(take)..];

    let (Some(first), Some(last)) = (tail.first(), tail.last()) else {
        return SplitResult::default();
    };

    if tail.len() < 2 || *first == 0.0 {
        return SplitResult::default();
    }

    let change = percent_change(*first, *last);

    SplitResult {
        state: state_for_change(change, requirement_pct, strong_requirement_pct),
        change,
    }
}

/// Signed percentage difference between two values, 2-decimal precision.
pub fn percent_change(first: f64, last: f64) -> f64 {
    if first == 0.0 {
        return 0.0;
    }

    let change = (last - first) / first * 100.0;
    (change * 100.0).round() / 100.0
}

fn state_for_change(change: f64, requirement_pct: f64, strong_requirement_pct: f64) -> State {
    if change >= strong_requirement_pct {
        State::StrongIncrease
    } else if change >= requirement_pct {
        State::Increase
    } else if change <= -strong_requirement_pct {
        State::StrongDecrease
    } else if change <= -requirement_pct {
        State::Decrease
    } else {
        State::Neutral
    }
}

/// Classify an averaged state value with the fixed mean thresholds.
pub fn classify_mean(average: f64) -> State {
    if average >= MEAN_STRONG_REQUIREMENT {
        State::StrongIncrease
    } else if average >= MEAN_REQUIREMENT {
        State::Increase
    } else if average <= -MEAN_STRONG_REQUIREMENT {
        State::StrongDecrease
    } else if average <= -MEAN_REQUIREMENT {
        State::Decrease
    } else {
        State::Neutral
    }
}
