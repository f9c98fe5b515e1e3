//! RaceBot Backend Library
//!
//! Adaptive timing core for racing an opponent's arrival against a
//! server-side cooldown window, plus the transport and supervisor that drive
//! it against a browser-automation backend.

pub mod config;
pub mod detector;
pub mod error;
pub mod metrics;
pub mod race;
pub mod supervisor;
pub mod timing;
pub mod transport;
