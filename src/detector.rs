//! Opponent detection
//!
//! Two sources feed the executor:
//! - polling: a round-trip presence check against the page (implemented by
//!   [`crate::race::browser::BrowserSession`])
//! - signal: `opponentDetected` events pushed by the backend, consumed here
//!   through a broadcast subscription with a bounded wait
//!
//! Both answer the "still present" re-check the same way, by polling.

use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::config::{DetectionMode, RaceConfig};
use crate::error::TransportError;

/// Pushed detection event
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub identifier: String,
    /// Wall-clock time of the observation (epoch ms)
    pub timestamp_ms: f64,
}

/// Result of one presence check
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Presence {
    pub present: bool,
    pub matched_id: Option<String>,
    /// How long before this value was returned the opponent was actually
    /// seen. `None` means "just now".
    pub age_ms: Option<f64>,
}

impl Presence {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn seen(matched_id: Option<String>) -> Self {
        Self {
            present: true,
            matched_id,
            age_ms: None,
        }
    }
}

#[async_trait]
pub trait OpponentDetector: Send + Sync {
    /// Initial detection for a race. Step failures read as absent; only a
    /// dead connection comes back as an error.
    async fn detect(&self, cfg: &RaceConfig) -> Result<Presence, TransportError>;

    /// Re-check right before committing. Never fails: any error reads as absent.
    async fn still_present(&self, cfg: &RaceConfig) -> Presence;
}

/// Case-insensitive match of an identifier against the configured opponents
pub fn matches_opponent(identifier: &str, opponents: &[String]) -> Option<String> {
    let id = identifier.trim();
    opponents
        .iter()
        .find(|o| o.trim().eq_ignore_ascii_case(id))
        .cloned()
}

/// Push-mode detector over the transport's event channel
pub struct SignalDetector {
    events: Mutex<broadcast::Receiver<Detection>>,
    verifier: Arc<dyn OpponentDetector>,
}

impl SignalDetector {
    /// `verifier` answers the pre-commit re-check
    pub fn new(events: broadcast::Receiver<Detection>, verifier: Arc<dyn OpponentDetector>) -> Self {
        Self {
            events: Mutex::new(events),
            verifier,
        }
    }

    fn now_epoch_ms() -> f64 {
        chrono::Utc::now().timestamp_millis() as f64
    }
}

#[async_trait]
impl OpponentDetector for SignalDetector {
    async fn detect(&self, cfg: &RaceConfig) -> Result<Presence, TransportError> {
        let mut events = self.events.lock().await;
        let wait = Duration::from_millis(cfg.signal_wait_ms);
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let event = match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => return Ok(Presence::absent()),
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(skipped, "detection_events_lagged");
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(TransportError::Closed),
                Ok(Ok(event)) => event,
            };

            let Some(matched) = matches_opponent(&event.identifier, &cfg.opponents) else {
                debug!(identifier = %event.identifier, "detection_ignored_unknown");
                continue;
            };

            let age_ms = (Self::now_epoch_ms() - event.timestamp_ms).max(0.0);
            if age_ms > cfg.max_signal_age_ms as f64 {
                debug!(identifier = %event.identifier, age_ms, "detection_ignored_stale");
                continue;
            }

            return Ok(Presence {
                present: true,
                matched_id: Some(matched),
                age_ms: Some(age_ms),
            });
        }
    }

    async fn still_present(&self, cfg: &RaceConfig) -> Presence {
        self.verifier.still_present(cfg).await
    }
}

/// Dispatches on the snapshot's `detection_mode`, so the mode can change on
/// config reload without rebuilding the executor
pub struct ModeSwitchDetector {
    polling: Arc<dyn OpponentDetector>,
    signal: Arc<dyn OpponentDetector>,
}

impl ModeSwitchDetector {
    pub fn new(polling: Arc<dyn OpponentDetector>, signal: Arc<dyn OpponentDetector>) -> Self {
        Self { polling, signal }
    }

    fn pick(&self, cfg: &RaceConfig) -> &Arc<dyn OpponentDetector> {
        match cfg.detection_mode {
            DetectionMode::Polling => &self.polling,
            DetectionMode::Signal => &self.signal,
        }
    }
}

#[async_trait]
impl OpponentDetector for ModeSwitchDetector {
    async fn detect(&self, cfg: &RaceConfig) -> Result<Presence, TransportError> {
        self.pick(cfg).detect(cfg).await
    }

    async fn still_present(&self, cfg: &RaceConfig) -> Presence {
        self.pick(cfg).still_present(cfg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysThere;

    #[async_trait]
    impl OpponentDetector for AlwaysThere {
        async fn detect(&self, _cfg: &RaceConfig) -> Result<Presence, TransportError> {
            Ok(Presence::seen(None))
        }

        async fn still_present(&self, _cfg: &RaceConfig) -> Presence {
            Presence::seen(Some("verified".into()))
        }
    }

    fn cfg() -> RaceConfig {
        RaceConfig {
            opponents: vec!["Alpha".into(), "beta".into()],
            signal_wait_ms: 50,
            max_signal_age_ms: 1_000,
            ..RaceConfig::default()
        }
    }

    #[test]
    fn test_matches_opponent_case_insensitive() {
        let opponents = vec!["Alpha".to_string()];
        assert_eq!(matches_opponent(" alpha ", &opponents), Some("Alpha".into()));
        assert_eq!(matches_opponent("gamma", &opponents), None);
    }

    #[tokio::test]
    async fn test_signal_detection_carries_age() {
        let (tx, rx) = broadcast::channel(8);
        let detector = SignalDetector::new(rx, Arc::new(AlwaysThere));

        let seen_at = chrono::Utc::now().timestamp_millis() as f64 - 40.0;
        tx.send(Detection {
            identifier: "ALPHA".into(),
            timestamp_ms: seen_at,
        })
        .unwrap();

        let presence = detector.detect(&cfg()).await.unwrap();
        assert!(presence.present);
        assert_eq!(presence.matched_id.as_deref(), Some("Alpha"));
        let age = presence.age_ms.unwrap();
        assert!(age >= 40.0 && age < 1_000.0, "age {}", age);
    }

    #[tokio::test]
    async fn test_signal_skips_unknown_and_stale() {
        let (tx, rx) = broadcast::channel(8);
        let detector = SignalDetector::new(rx, Arc::new(AlwaysThere));
        let now = chrono::Utc::now().timestamp_millis() as f64;

        tx.send(Detection {
            identifier: "gamma".into(),
            timestamp_ms: now,
        })
        .unwrap();
        tx.send(Detection {
            identifier: "beta".into(),
            timestamp_ms: now - 60_000.0,
        })
        .unwrap();

        let presence = detector.detect(&cfg()).await.unwrap();
        assert!(!presence.present);
    }

    #[tokio::test]
    async fn test_signal_delivered_between_waits_is_kept() {
        let (tx, rx) = broadcast::channel(8);
        let detector = SignalDetector::new(rx, Arc::new(AlwaysThere));

        assert!(!detector.detect(&cfg()).await.unwrap().present);

        // arrives while nobody is waiting
        tx.send(Detection {
            identifier: "beta".into(),
            timestamp_ms: chrono::Utc::now().timestamp_millis() as f64,
        })
        .unwrap();

        assert!(detector.detect(&cfg()).await.unwrap().present);
    }

    #[tokio::test]
    async fn test_closed_channel_is_transport_error() {
        let (tx, rx) = broadcast::channel::<Detection>(8);
        drop(tx);
        let detector = SignalDetector::new(rx, Arc::new(AlwaysThere));
        assert_eq!(detector.detect(&cfg()).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_recheck_delegates_to_verifier() {
        let (_tx, rx) = broadcast::channel(8);
        let detector = SignalDetector::new(rx, Arc::new(AlwaysThere));
        let p = detector.still_present(&cfg()).await;
        assert_eq!(p.matched_id.as_deref(), Some("verified"));
    }

    struct NeverThere;

    #[async_trait]
    impl OpponentDetector for NeverThere {
        async fn detect(&self, _cfg: &RaceConfig) -> Result<Presence, TransportError> {
            Ok(Presence::absent())
        }

        async fn still_present(&self, _cfg: &RaceConfig) -> Presence {
            Presence::absent()
        }
    }

    #[tokio::test]
    async fn test_mode_switch_follows_snapshot() {
        let detector = ModeSwitchDetector::new(Arc::new(NeverThere), Arc::new(AlwaysThere));
        let mut c = cfg();

        c.detection_mode = DetectionMode::Polling;
        assert!(!detector.detect(&c).await.unwrap().present);

        c.detection_mode = DetectionMode::Signal;
        assert!(detector.detect(&c).await.unwrap().present);
    }
}
