//! On-disk model state: one JSON document, overwritten whole after every
//! recorded outcome.
//!
//! Files written by older tooling (flat `successRatesByTiming` /
//! `avgPreAttackCheckDuration` layout, no version) are accepted and upgraded
//! to the current layout on the next save.

use std::{
    collections::BTreeMap,
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{
    bins::{BinStats, TimingBin},
    overhead::OverheadEstimator,
};
use crate::error::ModelError;

/// Current on-disk layout version
pub const MODEL_STATE_VERSION: u32 = 1;

/// Full persisted snapshot of the timing model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelState {
    #[serde(default)]
    pub version: u32,
    /// Bin width the keys were quantised with. Absent in legacy files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_size_ms: Option<u32>,
    #[serde(default, alias = "successRatesByTiming")]
    pub bins: BTreeMap<TimingBin, BinStats>,
    #[serde(default)]
    pub total_attempts: u64,
    #[serde(default)]
    pub moving_averages: OverheadEstimator,

    // Legacy flat layout
    #[serde(default, skip_serializing)]
    avg_pre_attack_check_duration: Option<f64>,
    #[serde(default, skip_serializing)]
    avg_imprison_duration: Option<f64>,
}

impl ModelState {
    pub fn new(
        bin_size_ms: u32,
        bins: BTreeMap<TimingBin, BinStats>,
        total_attempts: u64,
        moving_averages: OverheadEstimator,
    ) -> Self {
        Self {
            version: MODEL_STATE_VERSION,
            bin_size_ms: Some(bin_size_ms),
            bins,
            total_attempts,
            moving_averages,
            avg_pre_attack_check_duration: None,
            avg_imprison_duration: None,
        }
    }

    /// Sum of all bin attempts
    pub fn bin_attempts(&self) -> u64 {
        self.bins.values().map(|s| s.attempts).sum()
    }

    /// Fold legacy fields into the current layout and repair broken invariants
    fn normalize(mut self) -> Self {
        if let Some(v) = self.avg_pre_attack_check_duration.take() {
            self.moving_averages.pre_commit_check_ms = v;
        }
        if let Some(v) = self.avg_imprison_duration.take() {
            self.moving_averages.commit_action_ms = v;
        }
        self.moving_averages = self.moving_averages.sanitized();

        for (bin, stats) in self.bins.iter_mut() {
            if stats.successes > stats.attempts {
                warn!(
                    bin,
                    attempts = stats.attempts,
                    successes = stats.successes,
                    "model_bin_clamped"
                );
                stats.successes = stats.attempts;
            }
        }

        let sum = self.bin_attempts();
        if sum != self.total_attempts {
            warn!(
                stored = self.total_attempts,
                recomputed = sum,
                "model_total_attempts_repaired"
            );
            self.total_attempts = sum;
        }

        self.version = MODEL_STATE_VERSION;
        self
    }
}

/// Read a state file. `Ok(None)` when the file does not exist.
pub fn load_state(path: &Path) -> Result<Option<ModelState>, ModelError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let state: ModelState = serde_json::from_slice(&bytes)?;
    Ok(Some(state.normalize()))
}

/// Overwrite the state file. Writes a sibling temp file and renames it over
/// the target so a crash mid-write never leaves a truncated document.
pub fn save_state(path: &Path, state: &ModelState) -> Result<(), ModelError> {
    let payload = serde_json::to_vec_pretty(state)?;
    let tmp = temp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&payload)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "model_state".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let got = load_state(&dir.path().join("absent.json")).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.json");

        let mut bins = BTreeMap::new();
        bins.insert(
            40,
            BinStats {
                attempts: 3,
                successes: 2,
            },
        );
        bins.insert(
            45,
            BinStats {
                attempts: 1,
                successes: 0,
            },
        );
        let state = ModelState::new(5, bins, 4, OverheadEstimator::default());
        save_state(&path, &state).unwrap();

        let loaded = load_state(&path).unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.version, MODEL_STATE_VERSION);
        assert_eq!(loaded.bin_size_ms, Some(5));
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.json");
        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(load_state(&path), Err(ModelError::Parse(_))));
    }

    #[test]
    fn test_legacy_layout_is_upgraded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ml_model_state_ucb.json");
        fs::write(
            &path,
            r#"{
                "successRatesByTiming": {
                    "120": {"successes": 1, "attempts": 4},
                    "125": {"successes": 3, "attempts": 3}
                },
                "totalAttempts": 7,
                "avgPreAttackCheckDuration": 180.5,
                "avgImprisonDuration": 301.25
            }"#,
        )
        .unwrap();

        let state = load_state(&path).unwrap().unwrap();
        assert_eq!(state.version, MODEL_STATE_VERSION);
        assert_eq!(state.bin_size_ms, None);
        assert_eq!(state.total_attempts, 7);
        assert_eq!(state.bins[&120].attempts, 4);
        assert_eq!(state.bins[&125].successes, 3);
        assert_eq!(state.moving_averages.pre_commit_check_ms, 180.5);
        assert_eq!(state.moving_averages.commit_action_ms, 301.25);

        // legacy keys are not written back
        save_state(&path, &state).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("movingAverages"));
        assert!(!text.contains("avgImprisonDuration"));
    }

    #[test]
    fn test_invariants_repaired_on_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.json");
        fs::write(
            &path,
            r#"{"version":1,"bins":{"10":{"attempts":2,"successes":5}},"totalAttempts":99}"#,
        )
        .unwrap();

        let state = load_state(&path).unwrap().unwrap();
        assert_eq!(state.bins[&10].successes, 2);
        assert_eq!(state.total_attempts, 2);
        assert_eq!(state.moving_averages, OverheadEstimator::default());
    }
}
