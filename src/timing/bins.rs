//! Timing bin quantisation and per-bin statistics.

use serde::{Deserialize, Serialize};

/// Default bin width in milliseconds
pub const DEFAULT_BIN_SIZE_MS: u32 = 5;

/// Quantised point on the delay axis, in whole milliseconds
pub type TimingBin = i64;

/// Quantise a delay to the nearest multiple of `bin_size_ms`.
///
/// Every lookup and update goes through this function, so repeated visits to
/// the same delay accumulate in the same bin. Returns `None` for non-finite input.
#[inline]
pub fn quantize(timing_ms: f64, bin_size_ms: u32) -> Option<TimingBin> {
    if !timing_ms.is_finite() {
        return None;
    }
    let size = bin_size_ms.max(1) as f64;
    let binned = (timing_ms / size).round() * size;
    if binned.abs() > i64::MAX as f64 / 2.0 {
        return None;
    }
    Some(binned as TimingBin)
}

/// Attempt/success counters for one bin
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinStats {
    #[serde(default)]
    pub attempts: u64,
    #[serde(default)]
    pub successes: u64,
}

impl BinStats {
    #[inline]
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    pub fn record(&mut self, success: bool) {
        self.attempts += 1;
        if success {
            self.successes += 1;
        }
    }
}
