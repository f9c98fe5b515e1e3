//! Linear sweep across the permissible window.
//!
//! Deterministic alternative to UCB1: start at the earliest bound, step by a
//! fixed increment after each committed attempt, wrap past the latest bound.

use tracing::debug;

/// Offset state for the linear sweep
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepPlanner {
    offset_ms: f64,
}

impl SweepPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current offset past the earliest bound
    pub fn offset_ms(&self) -> f64 {
        self.offset_ms
    }

    /// Target for the next race. Wraps to `earliest_ms` when the offset has
    /// run past `latest_ms`.
    pub fn next_target(&mut self, earliest_ms: f64, latest_ms: f64) -> f64 {
        if !earliest_ms.is_finite() || !latest_ms.is_finite() {
            self.offset_ms = 0.0;
            return 0.0;
        }
        let target = earliest_ms + self.offset_ms;
        if target > latest_ms {
            debug!(earliest_ms, latest_ms, "sweep_wrapped");
            self.offset_ms = 0.0;
            return earliest_ms;
        }
        target
    }

    /// Step forward after a committed attempt. Non-positive increments fall
    /// back to `bin_size_ms`.
    pub fn advance(&mut self, increment_ms: f64, bin_size_ms: u32) {
        let step = if increment_ms.is_finite() && increment_ms > 0.0 {
            increment_ms
        } else {
            bin_size_ms.max(1) as f64
        };
        self.offset_ms += step;
    }

    /// Back to the earliest bound (opponent absent)
    pub fn reset(&mut self) {
        self.offset_ms = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_advances_and_wraps() {
        let mut sweep = SweepPlanner::new();
        let mut targets = Vec::new();
        for _ in 0..5 {
            targets.push(sweep.next_target(100.0, 120.0));
            sweep.advance(10.0, 5);
        }
        assert_eq!(targets, vec![100.0, 110.0, 120.0, 100.0, 110.0]);
    }

    #[test]
    fn test_non_positive_increment_uses_bin_size() {
        let mut sweep = SweepPlanner::new();
        sweep.advance(0.0, 5);
        sweep.advance(-3.0, 5);
        sweep.advance(f64::NAN, 5);
        assert_eq!(sweep.offset_ms(), 15.0);
    }

    #[test]
    fn test_reset_returns_to_earliest() {
        let mut sweep = SweepPlanner::new();
        sweep.advance(20.0, 5);
        assert_eq!(sweep.next_target(0.0, 100.0), 20.0);
        sweep.reset();
        assert_eq!(sweep.next_target(0.0, 100.0), 0.0);
    }
}
