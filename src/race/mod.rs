//! Race core: clock, capabilities, browser adapter and the executor state machine.

pub mod actions;
pub mod browser;
pub mod clock;
pub mod executor;

#[cfg(test)]
pub(crate) mod testing;

pub use actions::{CommitActions, SessionControl};
pub use browser::BrowserSession;
pub use clock::{MonotonicClock, RaceClock};
pub use executor::{AbortReason, RaceAttemptRecord, RaceExecutor, RaceOutcome, RaceState};
