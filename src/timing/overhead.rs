//! Exponential moving averages of the fixed overheads the executor cannot
//! eliminate: the pre-commit presence re-check and the commit action itself.

use serde::{Deserialize, Serialize};

/// EMA smoothing factor
pub const EMA_ALPHA: f64 = 0.1;
/// Seed for the pre-commit check average before any measurement
pub const DEFAULT_PRE_COMMIT_CHECK_MS: f64 = 150.0;
/// Seed for the commit action average before any measurement
pub const DEFAULT_COMMIT_ACTION_MS: f64 = 250.0;

/// Which overhead a measurement belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverheadKind {
    PreCommitCheck,
    CommitAction,
}

impl std::fmt::Display for OverheadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreCommitCheck => write!(f, "pre_commit_check"),
            Self::CommitAction => write!(f, "commit_action"),
        }
    }
}

/// Persisted moving averages, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverheadEstimator {
    #[serde(default = "default_pre_commit")]
    pub pre_commit_check_ms: f64,
    #[serde(default = "default_commit")]
    pub commit_action_ms: f64,
}

fn default_pre_commit() -> f64 {
    DEFAULT_PRE_COMMIT_CHECK_MS
}

fn default_commit() -> f64 {
    DEFAULT_COMMIT_ACTION_MS
}

impl Default for OverheadEstimator {
    fn default() -> Self {
        Self {
            pre_commit_check_ms: DEFAULT_PRE_COMMIT_CHECK_MS,
            commit_action_ms: DEFAULT_COMMIT_ACTION_MS,
        }
    }
}

impl OverheadEstimator {
    /// Fold one measurement into the average. Negative or non-finite input is
    /// ignored; returns whether the average changed.
    pub fn update(&mut self, kind: OverheadKind, measured_ms: f64) -> bool {
        if !measured_ms.is_finite() || measured_ms < 0.0 {
            return false;
        }
        let slot = match kind {
            OverheadKind::PreCommitCheck => &mut self.pre_commit_check_ms,
            OverheadKind::CommitAction => &mut self.commit_action_ms,
        };
        *slot = EMA_ALPHA * measured_ms + (1.0 - EMA_ALPHA) * *slot;
        true
    }

    pub fn get(&self, kind: OverheadKind) -> f64 {
        match kind {
            OverheadKind::PreCommitCheck => self.pre_commit_check_ms,
            OverheadKind::CommitAction => self.commit_action_ms,
        }
    }

    /// Total overhead expected between the end of the wait and the commit landing
    #[inline]
    pub fn total_ms(&self) -> f64 {
        self.pre_commit_check_ms + self.commit_action_ms
    }

    /// Replace non-finite or negative values (e.g. from a hand-edited file) with seeds
    pub(crate) fn sanitized(self) -> Self {
        let fix = |v: f64, seed: f64| if v.is_finite() && v >= 0.0 { v } else { seed };
        Self {
            pre_commit_check_ms: fix(self.pre_commit_check_ms, DEFAULT_PRE_COMMIT_CHECK_MS),
            commit_action_ms: fix(self.commit_action_ms, DEFAULT_COMMIT_ACTION_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_form(seed: f64, samples: &[f64]) -> f64 {
        samples
            .iter()
            .fold(seed, |avg, d| EMA_ALPHA * d + (1.0 - EMA_ALPHA) * avg)
    }

    #[test]
    fn test_ema_matches_closed_form() {
        let mut est = OverheadEstimator::default();
        for _ in 0..3 {
            assert!(est.update(OverheadKind::PreCommitCheck, 100.0));
        }
        // 150 -> 145 -> 140.5 -> 136.45
        assert!((est.pre_commit_check_ms - 136.45).abs() < 1e-9);
        assert!((est.pre_commit_check_ms - closed_form(150.0, &[100.0; 3])).abs() < 1e-9);
        // other slot untouched
        assert_eq!(est.commit_action_ms, DEFAULT_COMMIT_ACTION_MS);
    }

    #[test]
    fn test_ema_mixed_sequence() {
        let samples = [310.0, 120.5, 0.0, 275.25, 199.0];
        let mut est = OverheadEstimator::default();
        for d in samples {
            est.update(OverheadKind::CommitAction, d);
        }
        let expected = closed_form(DEFAULT_COMMIT_ACTION_MS, &samples);
        assert!((est.commit_action_ms - expected).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_invalid_samples() {
        let mut est = OverheadEstimator::default();
        assert!(!est.update(OverheadKind::CommitAction, -1.0));
        assert!(!est.update(OverheadKind::CommitAction, f64::NAN));
        assert!(!est.update(OverheadKind::CommitAction, f64::INFINITY));
        assert_eq!(est, OverheadEstimator::default());
    }

    #[test]
    fn test_sanitized_restores_seeds() {
        let est = OverheadEstimator {
            pre_commit_check_ms: f64::NAN,
            commit_action_ms: -4.0,
        }
        .sanitized();
        assert_eq!(est, OverheadEstimator::default());
        assert_eq!(est.total_ms(), 400.0);
    }
}
