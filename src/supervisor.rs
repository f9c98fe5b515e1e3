//! Session supervisor
//!
//! Perpetual loop around the race executor:
//! 1. log in once at start
//! 2. every iteration: take a config snapshot, release our actor if it is
//!    blocked, otherwise run one race
//! 3. any transport error: back off, then reconnect + reload + log in again
//!
//! A single failed race never ends the session. Only `max_retries`
//! consecutive failed recoveries do, after a final diagnostics dump.

use std::{
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{ConfigStore, RaceConfig};
use crate::error::{SessionFatal, TransportError};
use crate::metrics::RaceMetrics;
use crate::race::{RaceClock, RaceExecutor, SessionControl};
use crate::timing::SharedModel;

/// Default base of the recovery backoff
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
/// Default cap of the recovery backoff
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 30_000;
/// Default ceiling on consecutive failed recoveries (0 = unlimited)
pub const DEFAULT_MAX_RETRIES: u32 = 10;
/// Growth factor of the recovery backoff
pub const BACKOFF_MULTIPLIER: f64 = 1.5;

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    LoggingIn,
    Racing,
    Releasing,
    Recovering,
    Shutdown,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "INIT"),
            Self::LoggingIn => write!(f, "LOGGING_IN"),
            Self::Racing => write!(f, "RACING"),
            Self::Releasing => write!(f, "RELEASING"),
            Self::Recovering => write!(f, "RECOVERING"),
            Self::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// Reason for state transition (for logging)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Started,
    LoginOk,
    Blocked,
    Released,
    TransportFailure,
    Recovered,
    RetriesExhausted,
    ShutdownRequested,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::LoginOk => write!(f, "login_ok"),
            Self::Blocked => write!(f, "blocked"),
            Self::Released => write!(f, "released"),
            Self::TransportFailure => write!(f, "transport_failure"),
            Self::Recovered => write!(f, "recovered"),
            Self::RetriesExhausted => write!(f, "retries_exhausted"),
            Self::ShutdownRequested => write!(f, "shutdown"),
        }
    }
}

// =============================================================================
// BACKOFF
// =============================================================================

/// `min(base * 1.5^attempt, cap)`
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let raw = base_ms as f64 * BACKOFF_MULTIPLIER.powi(attempt.min(i32::MAX as u32) as i32);
    let capped = raw.min(cap_ms as f64);
    Duration::from_millis(capped as u64)
}

/// Consecutive-failure counter driving [`backoff_delay`]
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    attempt: u32,
    max_retries: u32,
    base_ms: u64,
    cap_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_CAP_MS)
    }
}

impl ReconnectPolicy {
    pub fn new(max_retries: u32, base_ms: u64, cap_ms: u64) -> Self {
        Self {
            attempt: 0,
            max_retries,
            base_ms,
            cap_ms,
        }
    }

    /// Delay before the next recovery attempt; bumps the counter
    pub fn next_backoff(&mut self) -> Duration {
        let delay = backoff_delay(self.attempt, self.base_ms, self.cap_ms);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset after a healthy iteration
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// No budget left (never true with `max_retries == 0`)
    pub fn exhausted(&self) -> bool {
        self.max_retries > 0 && self.attempt >= self.max_retries
    }
}

// =============================================================================
// SUPERVISOR
// =============================================================================

pub struct Supervisor {
    name: String,
    config: Arc<ConfigStore>,
    executor: RaceExecutor,
    session: Arc<dyn SessionControl>,
    clock: Arc<dyn RaceClock>,
    model: SharedModel,
    metrics: Arc<RaceMetrics>,
    policy: ReconnectPolicy,
    diagnostics_dir: PathBuf,
    shutdown: watch::Receiver<bool>,
    state: SessionState,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        config: Arc<ConfigStore>,
        executor: RaceExecutor,
        session: Arc<dyn SessionControl>,
        clock: Arc<dyn RaceClock>,
        model: SharedModel,
        metrics: Arc<RaceMetrics>,
        policy: ReconnectPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            executor,
            session,
            clock,
            model,
            metrics,
            policy,
            diagnostics_dir: PathBuf::from("."),
            shutdown,
            state: SessionState::Init,
        }
    }

    /// Directory for the final screenshot
    pub fn with_diagnostics_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.diagnostics_dir = dir.into();
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState, reason: TransitionReason) {
        let prev = self.state;
        self.state = next;
        info!(
            session = %self.name,
            from = %prev,
            to = %next,
            reason = %reason,
            "session_transition"
        );
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run until shutdown (`Ok`) or until recovery gives up (`Err`)
    pub async fn run(mut self) -> Result<(), SessionFatal> {
        self.transition(SessionState::LoggingIn, TransitionReason::Started);
        let cfg = self.config.snapshot();
        match self.session.login(&cfg).await {
            Ok(()) => self.transition(SessionState::Racing, TransitionReason::LoginOk),
            Err(e) => {
                warn!(session = %self.name, error = %e, "initial_login_failed");
                if !self.recover(e).await? {
                    return self.finish();
                }
            }
        }

        loop {
            if self.shutdown_requested() {
                return self.finish();
            }

            let cfg = self.config.snapshot();
            match self.iteration(&cfg).await {
                Ok(()) => {
                    if self.policy.attempt() > 0 {
                        info!(session = %self.name, attempts = self.policy.attempt(), "session_healthy");
                    }
                    self.policy.reset();
                }
                Err(e) => {
                    if !self.recover(e).await? {
                        return self.finish();
                    }
                }
            }
        }
    }

    async fn iteration(&mut self, cfg: &RaceConfig) -> Result<(), TransportError> {
        if self.session.is_blocked(cfg).await? {
            self.transition(SessionState::Releasing, TransitionReason::Blocked);
            self.metrics.record_release();
            self.session.release(cfg).await?;
            self.transition(SessionState::Racing, TransitionReason::Released);
            return Ok(());
        }
        self.executor.run_once(cfg).await.map(|_| ())
    }

    /// Back off and recover until it works. `Ok(false)` if shutdown was
    /// requested meanwhile.
    async fn recover(&mut self, cause: TransportError) -> Result<bool, SessionFatal> {
        self.metrics.record_recovery();
        self.transition(SessionState::Recovering, TransitionReason::TransportFailure);
        warn!(session = %self.name, error = %cause, "session_error");

        let mut last_error = cause;
        loop {
            if self.policy.exhausted() {
                self.transition(SessionState::Shutdown, TransitionReason::RetriesExhausted);
                self.dump_diagnostics().await;
                return Err(SessionFatal::RetriesExhausted {
                    attempts: self.policy.attempt(),
                    last_error: last_error.to_string(),
                });
            }

            let delay = self.policy.next_backoff();
            info!(
                session = %self.name,
                attempt = self.policy.attempt(),
                delay_ms = delay.as_millis() as u64,
                "session_backoff"
            );
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = self.clock.sleep(delay) => {}
                _ = shutdown.wait_for(|stop| *stop) => return Ok(false),
            }

            let cfg = self.config.snapshot();
            match self.session.recover(&cfg).await {
                Ok(()) => {
                    self.transition(SessionState::Racing, TransitionReason::Recovered);
                    return Ok(true);
                }
                Err(e) => {
                    warn!(session = %self.name, attempt = self.policy.attempt(), error = %e, "session_recovery_failed");
                    last_error = e;
                }
            }
        }
    }

    fn finish(&mut self) -> Result<(), SessionFatal> {
        self.transition(SessionState::Shutdown, TransitionReason::ShutdownRequested);
        if let Err(e) = self.model.lock().save() {
            warn!(session = %self.name, error = %e, "model_save_failed");
        }
        info!(session = %self.name, metrics = %self.metrics.summary(), "session_stopped");
        Ok(())
    }

    /// Final state before a fatal exit: counters, model file, screenshot
    async fn dump_diagnostics(&self) {
        error!(
            session = %self.name,
            metrics = %self.metrics.summary(),
            "session_fatal_diagnostics"
        );
        {
            let model = self.model.lock();
            if let Err(e) = model.save() {
                warn!(session = %self.name, error = %e, "model_save_failed");
            }
            error!(
                session = %self.name,
                total_attempts = model.total_attempts(),
                success_rate = format_args!("{:.3}", model.overall_success_rate()),
                "model_state_at_exit"
            );
        }

        let file = format!(
            "{}-{}.png",
            self.name,
            chrono::Utc::now().format("%Y%m%dT%H%M%S")
        );
        let path = self.diagnostics_dir.join(file);
        match self.session.screenshot(&path.to_string_lossy()).await {
            Ok(()) => info!(session = %self.name, path = %path.display(), "diagnostic_screenshot_saved"),
            Err(e) => warn!(session = %self.name, error = %e, "diagnostic_screenshot_failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::Presence;
    use crate::race::testing::{FakeActions, FakeClock, FakeDetector, FakeSession};
    use crate::timing::TimingModel;
    use parking_lot::Mutex;

    #[test]
    fn test_backoff_delay_growth_and_cap() {
        assert_eq!(backoff_delay(0, 1_000, 30_000), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(1, 1_000, 30_000), Duration::from_millis(1_500));
        assert_eq!(backoff_delay(2, 1_000, 30_000), Duration::from_millis(2_250));
        assert_eq!(backoff_delay(20, 1_000, 30_000), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(u32::MAX, 1_000, 30_000), Duration::from_millis(30_000));
    }

    #[test]
    fn test_policy_reset_and_exhaustion() {
        let mut policy = ReconnectPolicy::new(2, 100, 1_000);
        assert!(!policy.exhausted());
        assert_eq!(policy.next_backoff(), Duration::from_millis(100));
        assert_eq!(policy.next_backoff(), Duration::from_millis(150));
        assert!(policy.exhausted());

        policy.reset();
        assert_eq!(policy.attempt(), 0);
        assert_eq!(policy.next_backoff(), Duration::from_millis(100));
    }

    #[test]
    fn test_unlimited_policy_never_exhausts() {
        let mut policy = ReconnectPolicy::new(0, 10, 20);
        for _ in 0..1_000 {
            policy.next_backoff();
        }
        assert!(!policy.exhausted());
    }

    struct Rig {
        clock: Arc<FakeClock>,
        detector: Arc<FakeDetector>,
        session: Arc<FakeSession>,
        shutdown: watch::Sender<bool>,
        supervisor: Supervisor,
    }

    fn rig(policy: ReconnectPolicy, dir: &std::path::Path) -> Rig {
        let clock = Arc::new(FakeClock::default());
        let detector = Arc::new(FakeDetector::new(clock.clone(), 1.0, 1.0));
        let actions = Arc::new(FakeActions::new(clock.clone(), 1.0));
        let session = Arc::new(FakeSession::default());
        let model: SharedModel = Arc::new(Mutex::new(TimingModel::load(dir.join("model.json"), 5)));
        let metrics = Arc::new(RaceMetrics::new());
        let config = Arc::new(ConfigStore::from_config(
            dir.join("config.json"),
            RaceConfig {
                opponents: vec!["alpha".into()],
                earliest_ms: 0.0,
                latest_ms: 50.0,
                ..RaceConfig::default()
            },
        ));
        let executor = RaceExecutor::new(
            detector.clone(),
            actions,
            session.clone(),
            clock.clone(),
            model.clone(),
            metrics.clone(),
        );
        let (tx, rx) = watch::channel(false);
        let supervisor = Supervisor::new(
            "test",
            config,
            executor,
            session.clone(),
            clock.clone(),
            model,
            metrics,
            policy,
            rx,
        )
        .with_diagnostics_dir(dir);
        Rig {
            clock,
            detector,
            session,
            shutdown: tx,
            supervisor,
        }
    }

    #[tokio::test]
    async fn test_exhausted_recovery_is_fatal_with_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let r = rig(ReconnectPolicy::new(3, 100, 1_000), dir.path());
        r.detector.push_error(TransportError::Closed);
        for _ in 0..3 {
            r.session
                .recover_results
                .lock()
                .push_back(Err(TransportError::Connect("refused".into())));
        }

        let err = r.supervisor.run().await.unwrap_err();
        assert_eq!(
            err,
            SessionFatal::RetriesExhausted {
                attempts: 3,
                last_error: "connect failed: refused".into()
            }
        );
        assert_eq!(*r.session.recovers.lock(), 3);
        assert_eq!(
            *r.clock.sleeps.lock(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(150),
                Duration::from_millis(225)
            ]
        );
        assert_eq!(r.session.screenshots.lock().len(), 1);
        assert!(dir.path().join("model.json").exists());
    }

    #[tokio::test]
    async fn test_recovery_then_races_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let r = rig(ReconnectPolicy::new(3, 100, 1_000), dir.path());
        r.detector.push_error(TransportError::Timeout { action: "xpath" });
        for _ in 0..4 {
            r.detector.push(Presence::seen(Some("alpha".into())));
        }
        r.session.blocked.lock().extend([false, true]);

        let shutdown = r.shutdown;
        let detector = r.detector.clone();
        let handle = tokio::spawn(r.supervisor.run());

        // wait until every scripted detection has been consumed
        for _ in 0..1_000 {
            if detector.detections.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        shutdown.send(true).unwrap();

        assert_eq!(handle.await.unwrap(), Ok(()));
        assert_eq!(*r.session.recovers.lock(), 1);
        assert_eq!(*r.session.releases.lock(), 1);
        assert_eq!(*r.session.logins.lock(), 1);
        assert!(r.session.screenshots.lock().is_empty());
    }

    #[tokio::test]
    async fn test_login_failure_goes_through_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let r = rig(ReconnectPolicy::new(1, 10, 10), dir.path());
        r.session
            .login_results
            .lock()
            .push_back(Err(TransportError::Closed));
        r.session
            .recover_results
            .lock()
            .push_back(Err(TransportError::Closed));

        let err = r.supervisor.run().await.unwrap_err();
        assert!(matches!(err, SessionFatal::RetriesExhausted { attempts: 1, .. }));
    }
}
