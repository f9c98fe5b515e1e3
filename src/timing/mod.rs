//! Timing model: bins, overhead averages, UCB1 selection, persistence, sweep.

pub mod bins;
pub mod model;
pub mod overhead;
pub mod store;
pub mod sweep;

pub use bins::{quantize, BinStats, TimingBin, DEFAULT_BIN_SIZE_MS};
pub use model::{BinScore, TimingModel};
pub use overhead::{OverheadEstimator, OverheadKind};
pub use store::{load_state, save_state, ModelState};
pub use sweep::SweepPlanner;

use std::sync::Arc;

/// Model handle shared between the executor and the diagnostics path
pub type SharedModel = Arc<parking_lot::Mutex<TimingModel>>;
