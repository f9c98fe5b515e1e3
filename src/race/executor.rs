//! Race executor
//!
//! One call to [`RaceExecutor::run_once`] is one race:
//!
//! ```text
//! Idle -> Detecting -> Predicting -> Waiting -> ReVerifying -> Committing -> Recording -> Idle
//! ```
//!
//! The wait is computed relative to the detection instant, minus the learned
//! overhead of the re-check and commit steps, so the commit lands as close as
//! possible to the predicted target:
//!
//! ```text
//! planned_wait = max(0, target - (avg_pre_check + avg_commit) - elapsed_since_detection)
//! ```
//!
//! Only a commit that was actually attempted feeds the timing model. Races
//! that find nobody, fail to select the opponent, or lose the opponent during
//! the wait leave the model untouched.

use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use super::{
    actions::{CommitActions, SessionControl},
    clock::RaceClock,
};
use crate::config::{RaceConfig, TimingStrategy};
use crate::detector::OpponentDetector;
use crate::error::TransportError;
use crate::metrics::RaceMetrics;
use crate::timing::{quantize, OverheadKind, SharedModel, SweepPlanner, TimingBin};

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceState {
    Idle,
    Detecting,
    Predicting,
    Waiting,
    ReVerifying,
    Committing,
    Recording,
}

impl std::fmt::Display for RaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Detecting => write!(f, "DETECTING"),
            Self::Predicting => write!(f, "PREDICTING"),
            Self::Waiting => write!(f, "WAITING"),
            Self::ReVerifying => write!(f, "RE_VERIFYING"),
            Self::Committing => write!(f, "COMMITTING"),
            Self::Recording => write!(f, "RECORDING"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Nobody to race against
    NoOpponent,
    /// Opponent seen but could not be selected
    NotSelected,
    /// Opponent gone by the pre-commit re-check
    OpponentLeft,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoOpponent => write!(f, "no_opponent"),
            Self::NotSelected => write!(f, "not_selected"),
            Self::OpponentLeft => write!(f, "opponent_left"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RaceOutcome {
    Success,
    Aborted(AbortReason),
    Failed(String),
}

impl std::fmt::Display for RaceOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Aborted(reason) => write!(f, "aborted:{}", reason),
            Self::Failed(e) => write!(f, "failed:{}", e),
        }
    }
}

/// Measurements of one race iteration
#[derive(Debug, Clone, PartialEq)]
pub struct RaceAttemptRecord {
    pub opponent: Option<String>,
    pub target_ms: Option<TimingBin>,
    pub elapsed_before_wait_ms: f64,
    pub planned_wait_ms: f64,
    pub actual_wait_ms: f64,
    pub pre_check_ms: f64,
    pub commit_ms: f64,
    pub outcome: RaceOutcome,
}

impl RaceAttemptRecord {
    fn aborted(reason: AbortReason) -> Self {
        Self {
            opponent: None,
            target_ms: None,
            elapsed_before_wait_ms: 0.0,
            planned_wait_ms: 0.0,
            actual_wait_ms: 0.0,
            pre_check_ms: 0.0,
            commit_ms: 0.0,
            outcome: RaceOutcome::Aborted(reason),
        }
    }

    /// End-to-end cost from detection to the end of the commit
    pub fn total_execution_ms(&self) -> f64 {
        self.elapsed_before_wait_ms + self.actual_wait_ms + self.pre_check_ms + self.commit_ms
    }

    /// Whether the model saw this race
    pub fn committed(&self) -> bool {
        matches!(self.outcome, RaceOutcome::Success | RaceOutcome::Failed(_))
    }
}

// =============================================================================
// EXECUTOR
// =============================================================================

pub struct RaceExecutor {
    detector: Arc<dyn OpponentDetector>,
    actions: Arc<dyn CommitActions>,
    session: Arc<dyn SessionControl>,
    clock: Arc<dyn RaceClock>,
    model: SharedModel,
    metrics: Arc<RaceMetrics>,
    sweep: SweepPlanner,
    state: RaceState,
}

impl RaceExecutor {
    pub fn new(
        detector: Arc<dyn OpponentDetector>,
        actions: Arc<dyn CommitActions>,
        session: Arc<dyn SessionControl>,
        clock: Arc<dyn RaceClock>,
        model: SharedModel,
        metrics: Arc<RaceMetrics>,
    ) -> Self {
        Self {
            detector,
            actions,
            session,
            clock,
            model,
            metrics,
            sweep: SweepPlanner::new(),
            state: RaceState::Idle,
        }
    }

    pub fn state(&self) -> RaceState {
        self.state
    }

    fn transition(&mut self, next: RaceState) {
        debug!(from = %self.state, to = %next, "race_transition");
        self.state = next;
    }

    fn predict_target(&mut self, cfg: &RaceConfig) -> TimingBin {
        let model = self.model.lock();
        match cfg.strategy {
            TimingStrategy::Ucb1 => model.predict(cfg.earliest_ms, cfg.latest_ms),
            TimingStrategy::Sweep => {
                let t = self.sweep.next_target(cfg.earliest_ms, cfg.latest_ms);
                quantize(t, model.bin_size_ms()).unwrap_or(0)
            }
        }
    }

    /// Run one race. Transport errors outside the commit step bubble up for
    /// session recovery; everything else ends in a record.
    pub async fn run_once(&mut self, cfg: &RaceConfig) -> Result<RaceAttemptRecord, TransportError> {
        let result = self.race(cfg).await;
        self.transition(RaceState::Idle);
        result
    }

    async fn race(&mut self, cfg: &RaceConfig) -> Result<RaceAttemptRecord, TransportError> {
        self.transition(RaceState::Detecting);
        let detect_start = self.clock.now_ms();
        let presence = self.detector.detect(cfg).await?;

        if !presence.present {
            self.metrics.record_absent();
            self.sweep.reset();
            self.clock
                .sleep(Duration::from_millis(cfg.absent_backoff_ms))
                .await;
            return Ok(RaceAttemptRecord::aborted(AbortReason::NoOpponent));
        }

        self.metrics.record_race_started();
        let detected_at = match presence.age_ms {
            Some(age) => self.clock.now_ms() - age,
            None => detect_start,
        };

        let Some(opponent) = self.actions.prepare(cfg).await? else {
            self.metrics.record_not_selected();
            info!(seen = ?presence.matched_id, "race_aborted_not_selected");
            return Ok(RaceAttemptRecord::aborted(AbortReason::NotSelected));
        };

        // Predicting
        self.transition(RaceState::Predicting);
        let target = self.predict_target(cfg);
        let overhead = self.model.lock().overhead();

        // Waiting
        self.transition(RaceState::Waiting);
        let wait_start = self.clock.now_ms();
        let elapsed_before_wait = wait_start - detected_at;
        let planned_wait = (target as f64 - overhead.total_ms() - elapsed_before_wait).max(0.0);

        if planned_wait > 0.0 {
            self.clock
                .sleep(Duration::from_secs_f64(planned_wait / 1_000.0))
                .await;
        } else {
            self.metrics.record_zero_wait();
            debug!(target_ms = target, elapsed_before_wait_ms = elapsed_before_wait, "race_wait_skipped");
        }
        let actual_wait = self.clock.now_ms() - wait_start;

        // ReVerifying
        self.transition(RaceState::ReVerifying);
        let check_start = self.clock.now_ms();
        let still = self.detector.still_present(cfg).await;
        let pre_check = self.clock.now_ms() - check_start;
        self.model
            .lock()
            .update_moving_average(OverheadKind::PreCommitCheck, pre_check);

        let mut record = RaceAttemptRecord {
            opponent: Some(opponent),
            target_ms: Some(target),
            elapsed_before_wait_ms: elapsed_before_wait,
            planned_wait_ms: planned_wait,
            actual_wait_ms: actual_wait,
            pre_check_ms: pre_check,
            commit_ms: 0.0,
            outcome: RaceOutcome::Aborted(AbortReason::OpponentLeft),
        };

        if !still.present {
            self.actions.dismiss().await;
            self.metrics.record_opponent_left();
            log_summary(&record);
            return Ok(record);
        }

        // Committing
        self.transition(RaceState::Committing);
        let commit_start = self.clock.now_ms();
        let committed = self.actions.commit(cfg).await;
        record.commit_ms = self.clock.now_ms() - commit_start;

        record.outcome = match &committed {
            Ok(()) => {
                self.model
                    .lock()
                    .update_moving_average(OverheadKind::CommitAction, record.commit_ms);
                RaceOutcome::Success
            }
            Err(e) => {
                warn!(error = %e, target_ms = target, "commit_failed");
                RaceOutcome::Failed(e.to_string())
            }
        };
        let success = committed.is_ok();
        self.metrics.record_commit(success);
        if cfg.strategy == TimingStrategy::Sweep {
            let bin_size = self.model.lock().bin_size_ms();
            self.sweep.advance(cfg.sweep_increment_ms, bin_size);
        }

        // Recording
        self.transition(RaceState::Recording);
        self.model
            .lock()
            .record(target as f64, success, record.total_execution_ms());
        log_summary(&record);

        // the page is left in the post-commit dialog either way
        self.session.reload().await?;
        Ok(record)
    }
}

fn log_summary(record: &RaceAttemptRecord) {
    info!(
        opponent = record.opponent.as_deref().unwrap_or("-"),
        target_ms = record.target_ms,
        planned_wait_ms = format_args!("{:.2}", record.planned_wait_ms),
        actual_wait_ms = format_args!("{:.2}", record.actual_wait_ms),
        elapsed_before_wait_ms = format_args!("{:.2}", record.elapsed_before_wait_ms),
        pre_check_ms = format_args!("{:.2}", record.pre_check_ms),
        commit_ms = format_args!("{:.2}", record.commit_ms),
        total_execution_ms = format_args!("{:.2}", record.total_execution_ms()),
        outcome = %record.outcome,
        "race_summary"
    );
}
