//! UCB1 timing model
//!
//! Chooses how long after detecting the opponent the commit should land.
//! The permissible window is discretised into bins; each bin is an arm of a
//! multi-armed bandit scored with UCB1:
//!
//! ```text
//! score(b) = +inf                                         if attempts(b) == 0
//!          = rate(b) + C * sqrt(ln(total) / attempts(b))  otherwise,  C = sqrt(2)
//! ```
//!
//! Untried bins always win, so a cold model sweeps the whole window once
//! before it starts exploiting. Ties go to the earliest bin.
//!
//! Nothing here returns an error to the caller: bad ranges degrade to the
//! midpoint, bad timings are logged and dropped, persistence failures are
//! logged and the in-memory state keeps going.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use super::{
    bins::{quantize, BinStats, TimingBin, DEFAULT_BIN_SIZE_MS},
    overhead::{OverheadEstimator, OverheadKind},
    store::{load_state, save_state, ModelState},
};
use crate::error::ModelError;

/// UCB1 exploration constant
pub const EXPLORATION_FACTOR: f64 = std::f64::consts::SQRT_2;

/// Upper bound on candidate bins scanned by one prediction
pub const MAX_CANDIDATE_BINS: usize = 100_000;

/// One scored candidate (exposed for diagnostics)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinScore {
    pub bin: TimingBin,
    pub stats: BinStats,
    pub score: f64,
}

/// Online timing estimator with optional file persistence
#[derive(Debug)]
pub struct TimingModel {
    bin_size_ms: u32,
    bins: BTreeMap<TimingBin, BinStats>,
    total_attempts: u64,
    overhead: OverheadEstimator,
    path: Option<PathBuf>,
}

impl Default for TimingModel {
    fn default() -> Self {
        Self::in_memory(DEFAULT_BIN_SIZE_MS)
    }
}

impl TimingModel {
    /// Model without a backing file
    pub fn in_memory(bin_size_ms: u32) -> Self {
        Self {
            bin_size_ms: bin_size_ms.max(1),
            bins: BTreeMap::new(),
            total_attempts: 0,
            overhead: OverheadEstimator::default(),
            path: None,
        }
    }

    /// Load from `path`, falling back to an empty model when the file is
    /// missing or unreadable. The path is kept for subsequent saves.
    pub fn load(path: impl Into<PathBuf>, bin_size_ms: u32) -> Self {
        let path = path.into();
        let mut model = Self::in_memory(bin_size_ms);

        match load_state(&path) {
            Ok(Some(state)) => {
                model.apply_state(state);
                info!(
                    path = %path.display(),
                    bins = model.bins.len(),
                    total_attempts = model.total_attempts,
                    pre_commit_check_ms = format_args!("{:.2}", model.overhead.pre_commit_check_ms),
                    commit_action_ms = format_args!("{:.2}", model.overhead.commit_action_ms),
                    "model_loaded"
                );
            }
            Ok(None) => {
                info!(path = %path.display(), "model_file_absent, starting fresh");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "model_load_failed, starting fresh");
            }
        }

        model.path = Some(path);
        model
    }

    fn apply_state(&mut self, state: ModelState) {
        self.total_attempts = state.total_attempts;
        self.overhead = state.moving_averages;
        self.bins = match state.bin_size_ms {
            Some(stored) if stored != self.bin_size_ms => {
                let bins = rebin(&state.bins, self.bin_size_ms);
                warn!(
                    stored_bin_size_ms = stored,
                    bin_size_ms = self.bin_size_ms,
                    bins_before = state.bins.len(),
                    bins_after = bins.len(),
                    "model_bin_size_changed, statistics re-binned"
                );
                bins
            }
            _ => state.bins,
        };
    }

    /// Persisted snapshot of the current statistics
    pub fn snapshot(&self) -> ModelState {
        ModelState::new(
            self.bin_size_ms,
            self.bins.clone(),
            self.total_attempts,
            self.overhead,
        )
    }

    /// Write the snapshot to the backing file (no-op for in-memory models)
    pub fn save(&self) -> Result<(), ModelError> {
        match &self.path {
            Some(path) => save_state(path, &self.snapshot()),
            None => Ok(()),
        }
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            warn!(error = %e, "model_save_failed");
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn bin_size_ms(&self) -> u32 {
        self.bin_size_ms
    }

    pub fn total_attempts(&self) -> u64 {
        self.total_attempts
    }

    pub fn stats(&self, timing_ms: f64) -> BinStats {
        quantize(timing_ms, self.bin_size_ms)
            .and_then(|b| self.bins.get(&b).copied())
            .unwrap_or_default()
    }

    /// Every visited bin in ascending order
    pub fn bins(&self) -> impl Iterator<Item = (TimingBin, BinStats)> + '_ {
        self.bins.iter().map(|(b, s)| (*b, *s))
    }

    pub fn overhead(&self) -> OverheadEstimator {
        self.overhead
    }

    /// Successes over attempts across all bins
    pub fn overall_success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            return 0.0;
        }
        let successes: u64 = self.bins.values().map(|s| s.successes).sum();
        successes as f64 / self.total_attempts as f64
    }

    fn ucb_score(&self, stats: &BinStats) -> f64 {
        if stats.attempts == 0 {
            return f64::INFINITY;
        }
        let total = self.total_attempts.max(1) as f64;
        stats.success_rate() + EXPLORATION_FACTOR * (total.ln() / stats.attempts as f64).sqrt()
    }

    /// Candidate bins for a window, ascending. `None` if the window is invalid
    /// or too wide to scan.
    fn candidates(&self, range_start_ms: f64, range_end_ms: f64) -> Option<Vec<TimingBin>> {
        let valid = range_start_ms.is_finite()
            && range_end_ms.is_finite()
            && range_start_ms >= 0.0
            && range_end_ms >= 0.0
            && range_start_ms <= range_end_ms;
        if !valid {
            return None;
        }

        let step = self.bin_size_ms as f64;
        let span = ((range_end_ms - range_start_ms) / step).floor();
        if span >= MAX_CANDIDATE_BINS as f64 {
            return None;
        }

        let mut out: Vec<TimingBin> = Vec::with_capacity(span as usize + 1);
        for i in 0..=(span as usize) {
            let t = range_start_ms + i as f64 * step;
            if let Some(bin) = quantize(t, self.bin_size_ms) {
                if out.last() != Some(&bin) {
                    out.push(bin);
                }
            }
        }
        Some(out)
    }

    /// Score every candidate bin in the window (ascending order)
    pub fn scores(&self, range_start_ms: f64, range_end_ms: f64) -> Vec<BinScore> {
        self.candidates(range_start_ms, range_end_ms)
            .unwrap_or_default()
            .into_iter()
            .map(|bin| {
                let stats = self.bins.get(&bin).copied().unwrap_or_default();
                BinScore {
                    bin,
                    stats,
                    score: self.ucb_score(&stats),
                }
            })
            .collect()
    }

    /// Pick the target delay for the next race inside `[range_start_ms, range_end_ms]`
    pub fn predict(&self, range_start_ms: f64, range_end_ms: f64) -> TimingBin {
        let Some(candidates) = self.candidates(range_start_ms, range_end_ms) else {
            let fallback = degraded_midpoint(range_start_ms, range_end_ms);
            warn!(
                range_start_ms,
                range_end_ms,
                fallback_ms = fallback,
                "invalid_timing_range, using midpoint"
            );
            return fallback;
        };

        let mut best: Option<(TimingBin, f64)> = None;
        for bin in candidates {
            let stats = self.bins.get(&bin).copied().unwrap_or_default();
            let score = self.ucb_score(&stats);
            // strict comparison keeps the earliest bin on ties
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((bin, score));
            }
        }

        match best {
            Some((bin, score)) => {
                debug!(
                    range_start_ms,
                    range_end_ms,
                    target_ms = bin,
                    score = %score,
                    "ucb_prediction"
                );
                bin
            }
            None => degraded_midpoint(range_start_ms, range_end_ms),
        }
    }

    /// Record the outcome of a race that aimed at `target_ms`.
    ///
    /// `total_execution_ms` is diagnostic only; the bin key is always the target.
    pub fn record(&mut self, target_ms: f64, success: bool, total_execution_ms: f64) {
        let bin = match quantize(target_ms, self.bin_size_ms) {
            Some(bin) if target_ms >= 0.0 => bin,
            _ => {
                warn!(target_ms, "invalid_timing_in_record, ignoring");
                return;
            }
        };

        let stats = self.bins.entry(bin).or_default();
        stats.record(success);
        let stats = *stats;
        self.total_attempts += 1;

        self.persist();

        info!(
            bin_ms = bin,
            success,
            successes = stats.successes,
            attempts = stats.attempts,
            rate_pct = format_args!("{:.1}", stats.success_rate() * 100.0),
            total_attempts = self.total_attempts,
            total_execution_ms = format_args!("{:.2}", total_execution_ms),
            "race_result_recorded"
        );
    }

    /// Fold a measured overhead into its moving average
    pub fn update_moving_average(&mut self, kind: OverheadKind, measured_ms: f64) {
        if self.overhead.update(kind, measured_ms) {
            debug!(
                kind = %kind,
                measured_ms = format_args!("{:.2}", measured_ms),
                average_ms = format_args!("{:.2}", self.overhead.get(kind)),
                "overhead_updated"
            );
        } else {
            debug!(kind = %kind, measured_ms, "overhead_sample_rejected");
        }
    }

    /// Seed a bin directly (used when importing statistics and in tests)
    pub fn seed_bin(&mut self, timing_ms: f64, stats: BinStats) {
        if let Some(bin) = quantize(timing_ms, self.bin_size_ms) {
            let previous = self.bins.insert(bin, stats).unwrap_or_default();
            self.total_attempts = self.total_attempts - previous.attempts + stats.attempts;
        }
    }
}

/// Merge statistics keyed at one bin width into bins of `bin_size_ms`
fn rebin(bins: &BTreeMap<TimingBin, BinStats>, bin_size_ms: u32) -> BTreeMap<TimingBin, BinStats> {
    let mut out: BTreeMap<TimingBin, BinStats> = BTreeMap::new();
    for (&bin, stats) in bins {
        let Some(key) = quantize(bin as f64, bin_size_ms) else {
            continue;
        };
        let merged = out.entry(key).or_default();
        merged.attempts += stats.attempts;
        merged.successes += stats.successes;
    }
    out
}

fn degraded_midpoint(range_start_ms: f64, range_end_ms: f64) -> TimingBin {
    if range_start_ms.is_finite() && range_end_ms.is_finite() {
        ((range_start_ms + range_end_ms) / 2.0).round() as TimingBin
    } else {
        0
    }
}
