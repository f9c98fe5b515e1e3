//! Per-session race counters, reported in log lines and the diagnostics dump.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RaceMetrics {
    pub races_started: AtomicU64,
    pub opponents_absent: AtomicU64,
    pub not_selected: AtomicU64,
    pub opponents_left: AtomicU64,
    pub commits: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub zero_waits: AtomicU64,
    pub recoveries: AtomicU64,
    pub releases: AtomicU64,
}

impl RaceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_race_started(&self) {
        self.races_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_absent(&self) {
        self.opponents_absent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_not_selected(&self) {
        self.not_selected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_opponent_left(&self) {
        self.opponents_left.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_commit(&self, success: bool) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_zero_wait(&self) {
        self.zero_waits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Summary string for logging
    pub fn summary(&self) -> String {
        format!(
            "races={} commits={} ok={} failed={} absent={} not_selected={} left={} zero_wait={} recoveries={} releases={}",
            self.races_started.load(Ordering::Relaxed),
            self.commits.load(Ordering::Relaxed),
            self.successes.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
            self.opponents_absent.load(Ordering::Relaxed),
            self.not_selected.load(Ordering::Relaxed),
            self.opponents_left.load(Ordering::Relaxed),
            self.zero_waits.load(Ordering::Relaxed),
            self.recoveries.load(Ordering::Relaxed),
            self.releases.load(Ordering::Relaxed),
        )
    }
}
