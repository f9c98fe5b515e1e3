//! Deterministic doubles for the race traits (test builds only).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc, time::Duration};

use super::{
    actions::{CommitActions, SessionControl},
    clock::RaceClock,
};
use crate::config::RaceConfig;
use crate::detector::{OpponentDetector, Presence};
use crate::error::TransportError;

/// Manual clock; `sleep` advances time instantly
#[derive(Default)]
pub struct FakeClock {
    pub now: Mutex<f64>,
    pub sleeps: Mutex<Vec<Duration>>,
}

impl FakeClock {
    pub fn advance(&self, ms: f64) {
        *self.now.lock() += ms;
    }
}

#[async_trait]
impl RaceClock for FakeClock {
    fn now_ms(&self) -> f64 {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        self.advance(duration.as_secs_f64() * 1_000.0);
        tokio::task::yield_now().await;
    }
}

/// Scripted detector. Empty queues mean "absent" for detection and
/// "still there" for the re-check.
pub struct FakeDetector {
    clock: Arc<FakeClock>,
    pub detections: Mutex<VecDeque<Result<Presence, TransportError>>>,
    pub rechecks: Mutex<VecDeque<bool>>,
    detect_cost_ms: f64,
    recheck_cost_ms: f64,
}

impl FakeDetector {
    pub fn new(clock: Arc<FakeClock>, detect_cost_ms: f64, recheck_cost_ms: f64) -> Self {
        Self {
            clock,
            detections: Mutex::new(VecDeque::new()),
            rechecks: Mutex::new(VecDeque::new()),
            detect_cost_ms,
            recheck_cost_ms,
        }
    }

    pub fn push(&self, presence: Presence) {
        self.detections.lock().push_back(Ok(presence));
    }

    pub fn push_error(&self, e: TransportError) {
        self.detections.lock().push_back(Err(e));
    }
}

#[async_trait]
impl OpponentDetector for FakeDetector {
    async fn detect(&self, _cfg: &RaceConfig) -> Result<Presence, TransportError> {
        self.clock.advance(self.detect_cost_ms);
        self.detections
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(Presence::absent()))
    }

    async fn still_present(&self, _cfg: &RaceConfig) -> Presence {
        self.clock.advance(self.recheck_cost_ms);
        if self.rechecks.lock().pop_front().unwrap_or(true) {
            Presence::seen(None)
        } else {
            Presence::absent()
        }
    }
}

/// Commit side with scripted results and call counters
pub struct FakeActions {
    clock: Arc<FakeClock>,
    commit_cost_ms: f64,
    pub commit_results: Mutex<VecDeque<Result<(), TransportError>>>,
    pub selected: Mutex<Option<String>>,
    pub commits: Mutex<u32>,
    pub dismissed: Mutex<u32>,
}

impl FakeActions {
    pub fn new(clock: Arc<FakeClock>, commit_cost_ms: f64) -> Self {
        Self {
            clock,
            commit_cost_ms,
            commit_results: Mutex::new(VecDeque::new()),
            selected: Mutex::new(Some("alpha".into())),
            commits: Mutex::new(0),
            dismissed: Mutex::new(0),
        }
    }
}

#[async_trait]
impl CommitActions for FakeActions {
    async fn prepare(&self, _cfg: &RaceConfig) -> Result<Option<String>, TransportError> {
        Ok(self.selected.lock().clone())
    }

    async fn commit(&self, _cfg: &RaceConfig) -> Result<(), TransportError> {
        *self.commits.lock() += 1;
        self.clock.advance(self.commit_cost_ms);
        self.commit_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn dismiss(&self) {
        *self.dismissed.lock() += 1;
    }
}

/// Session control with scripted results and call counters
#[derive(Default)]
pub struct FakeSession {
    pub blocked: Mutex<VecDeque<bool>>,
    pub login_results: Mutex<VecDeque<Result<(), TransportError>>>,
    pub recover_results: Mutex<VecDeque<Result<(), TransportError>>>,
    pub logins: Mutex<u32>,
    pub releases: Mutex<u32>,
    pub reloads: Mutex<u32>,
    pub recovers: Mutex<u32>,
    pub screenshots: Mutex<Vec<String>>,
}

#[async_trait]
impl SessionControl for FakeSession {
    async fn login(&self, _cfg: &RaceConfig) -> Result<(), TransportError> {
        *self.logins.lock() += 1;
        self.login_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn is_blocked(&self, _cfg: &RaceConfig) -> Result<bool, TransportError> {
        Ok(self.blocked.lock().pop_front().unwrap_or(false))
    }

    async fn release(&self, _cfg: &RaceConfig) -> Result<(), TransportError> {
        *self.releases.lock() += 1;
        Ok(())
    }

    async fn reload(&self) -> Result<(), TransportError> {
        *self.reloads.lock() += 1;
        Ok(())
    }

    async fn recover(&self, _cfg: &RaceConfig) -> Result<(), TransportError> {
        *self.recovers.lock() += 1;
        self.recover_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn screenshot(&self, path: &str) -> Result<(), TransportError> {
        self.screenshots.lock().push(path.to_string());
        Ok(())
    }
}
