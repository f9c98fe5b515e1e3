//! Time source for race timing.
//!
//! All race measurements are deltas on one monotonic axis; wall-clock time is
//! only used to age pushed detections.

use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait RaceClock: Send + Sync {
    /// Milliseconds on a monotonic axis with an arbitrary origin
    fn now_ms(&self) -> f64;

    /// Cooperative sleep
    async fn sleep(&self, duration: Duration);
}

/// TSC-backed monotonic clock with tokio sleeps
#[derive(Clone)]
pub struct MonotonicClock {
    clock: quanta::Clock,
    origin: quanta::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        let clock = quanta::Clock::new();
        let origin = clock.now();
        Self { clock, origin }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RaceClock for MonotonicClock {
    #[inline]
    fn now_ms(&self) -> f64 {
        self.clock.now().duration_since(self.origin).as_secs_f64() * 1_000.0
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_monotonic_sleep_advances() {
        let clock = MonotonicClock::new();
        let t0 = clock.now_ms();
        clock.sleep(Duration::from_millis(20)).await;
        let elapsed = clock.now_ms() - t0;
        assert!(elapsed >= 19.0, "elapsed {}", elapsed);
    }
}
