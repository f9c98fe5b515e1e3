//! Race configuration
//!
//! The config file is JSON and may be edited while the bot is running. Every
//! key is parsed on its own: a missing or malformed key keeps whatever value
//! the previous snapshot had, so a typo in one field never takes the session
//! down or resets the others.
//!
//! Readers take one `Arc<RaceConfig>` snapshot per race iteration and never
//! re-read mid-race.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use arc_swap::ArcSwap;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Quiet period after a change notification before the file is re-read
pub const DEFAULT_WATCH_DEBOUNCE_MS: u64 = 200;

// =============================================================================
// SNAPSHOT
// =============================================================================

/// How the executor picks its target delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimingStrategy {
    #[default]
    Ucb1,
    Sweep,
}

impl TimingStrategy {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ucb1" | "ucb" | "bandit" => Some(Self::Ucb1),
            "sweep" | "linear" => Some(Self::Sweep),
            _ => None,
        }
    }
}

impl std::fmt::Display for TimingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ucb1 => write!(f, "ucb1"),
            Self::Sweep => write!(f, "sweep"),
        }
    }
}

/// Where opponent detections come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectionMode {
    /// Round-trip presence checks against the page
    #[default]
    Polling,
    /// Out-of-band `opponentDetected` events pushed by the backend
    Signal,
}

impl DetectionMode {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "polling" | "poll" => Some(Self::Polling),
            "signal" | "push" => Some(Self::Signal),
            _ => None,
        }
    }
}

impl std::fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Polling => write!(f, "polling"),
            Self::Signal => write!(f, "signal"),
        }
    }
}

/// Immutable configuration snapshot for one race iteration
#[derive(Debug, Clone, PartialEq)]
pub struct RaceConfig {
    /// Opponent names to match, in priority order
    pub opponents: Vec<String>,
    /// Location the actor sits in (used by the blocked check and detection)
    pub location: String,
    /// Recovery credential used by the login sequence
    pub recovery_code: String,
    /// Earliest permissible delay after detection
    pub earliest_ms: f64,
    /// Latest permissible delay after detection
    pub latest_ms: f64,
    /// Step of the linear sweep strategy
    pub sweep_increment_ms: f64,
    pub strategy: TimingStrategy,
    pub detection_mode: DetectionMode,
    /// Pause after a detection that found nobody
    pub absent_backoff_ms: u64,
    /// Bounded wait on the detection signal in signal mode
    pub signal_wait_ms: u64,
    /// Signals older than this are ignored
    pub max_signal_age_ms: u64,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            opponents: Vec::new(),
            location: String::new(),
            recovery_code: String::new(),
            earliest_ms: 0.0,
            latest_ms: 0.0,
            sweep_increment_ms: 0.0,
            strategy: TimingStrategy::Ucb1,
            detection_mode: DetectionMode::Polling,
            absent_backoff_ms: 50,
            signal_wait_ms: 1_000,
            max_signal_age_ms: 2_000,
        }
    }
}

/// Config document could not be used at all
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    NotAnObject,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config file i/o: {}", e),
            Self::Parse(e) => write!(f, "config file parse: {}", e),
            Self::NotAnObject => write!(f, "config file is not a JSON object"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl RaceConfig {
    /// Build the next snapshot from `prior` and a parsed document.
    ///
    /// Unknown keys are ignored. Each recognised key that is present but
    /// malformed is logged and skipped.
    pub fn merge_json(prior: &RaceConfig, doc: &Value) -> Result<RaceConfig, ConfigError> {
        let obj = doc.as_object().ok_or(ConfigError::NotAnObject)?;
        let mut next = prior.clone();

        if let Some((key, v)) = lookup(obj, &["opponents", "rival", "rivals"]) {
            match parse_opponents(v) {
                Some(list) => next.opponents = list,
                None => invalid_key(key, v),
            }
        }
        if let Some((key, v)) = lookup(obj, &["location", "planetName"]) {
            match v.as_str() {
                Some(s) => next.location = s.trim().to_string(),
                None => invalid_key(key, v),
            }
        }
        if let Some((key, v)) = lookup(obj, &["recoveryCode", "RC"]) {
            match v.as_str() {
                Some(s) => next.recovery_code = s.trim().to_string(),
                None => invalid_key(key, v),
            }
        }
        if let Some((key, v)) = lookup(obj, &["earliestMs", "AttackTime"]) {
            match parse_ms(v) {
                Some(ms) => next.earliest_ms = ms,
                None => invalid_key(key, v),
            }
        }
        if let Some((key, v)) = lookup(obj, &["latestMs", "DefenceTime"]) {
            match parse_ms(v) {
                Some(ms) => next.latest_ms = ms,
                None => invalid_key(key, v),
            }
        }
        if let Some((key, v)) = lookup(obj, &["sweepIncrementMs", "interval"]) {
            match parse_ms(v) {
                Some(ms) => next.sweep_increment_ms = ms,
                None => invalid_key(key, v),
            }
        }
        if let Some((key, v)) = lookup(obj, &["strategy"]) {
            match v.as_str().and_then(TimingStrategy::parse) {
                Some(s) => next.strategy = s,
                None => invalid_key(key, v),
            }
        }
        if let Some((key, v)) = lookup(obj, &["detectionMode"]) {
            match v.as_str().and_then(DetectionMode::parse) {
                Some(m) => next.detection_mode = m,
                None => invalid_key(key, v),
            }
        }
        if let Some((key, v)) = lookup(obj, &["absentBackoffMs"]) {
            match parse_ms(v) {
                Some(ms) => next.absent_backoff_ms = ms as u64,
                None => invalid_key(key, v),
            }
        }
        if let Some((key, v)) = lookup(obj, &["signalWaitMs"]) {
            match parse_ms(v) {
                Some(ms) => next.signal_wait_ms = ms as u64,
                None => invalid_key(key, v),
            }
        }
        if let Some((key, v)) = lookup(obj, &["maxSignalAgeMs"]) {
            match parse_ms(v) {
                Some(ms) => next.max_signal_age_ms = ms as u64,
                None => invalid_key(key, v),
            }
        }

        if next.earliest_ms > next.latest_ms {
            // left as-is; the model degrades to the midpoint for inverted windows
            warn!(
                earliest_ms = next.earliest_ms,
                latest_ms = next.latest_ms,
                "config_window_inverted"
            );
        }

        Ok(next)
    }

    /// Read and merge a config file on top of `prior`
    pub fn load_file(prior: &RaceConfig, path: &Path) -> Result<RaceConfig, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::Io)?;
        let doc: Value = serde_json::from_str(&text).map_err(ConfigError::Parse)?;
        Self::merge_json(prior, &doc)
    }
}

fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&'static str]) -> Option<(&'static str, &'a Value)> {
    keys.iter()
        .find_map(|k| obj.get(*k).filter(|v| !v.is_null()).map(|v| (*k, v)))
}

fn invalid_key(key: &str, value: &Value) {
    warn!(key, value = %value, "config_key_invalid, keeping prior value");
}

fn parse_ms(v: &Value) -> Option<f64> {
    let ms = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (ms.is_finite() && ms >= 0.0).then_some(ms)
}

fn parse_opponents(v: &Value) -> Option<Vec<String>> {
    let split = |s: &str| -> Vec<String> {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    };
    match v {
        Value::String(s) => Some(split(s)),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.extend(split(item.as_str()?));
            }
            Some(out)
        }
        _ => None,
    }
}

// =============================================================================
// STORE
// =============================================================================

/// Hot-reloadable holder of the current config snapshot
pub struct ConfigStore {
    path: PathBuf,
    current: ArcSwap<RaceConfig>,
}

impl ConfigStore {
    /// Initial load. A missing or unreadable file yields the defaults.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let initial = match RaceConfig::load_file(&RaceConfig::default(), &path) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config_load_failed, using defaults");
                RaceConfig::default()
            }
        };
        info!(
            path = %path.display(),
            opponents = initial.opponents.len(),
            earliest_ms = initial.earliest_ms,
            latest_ms = initial.latest_ms,
            strategy = %initial.strategy,
            detection_mode = %initial.detection_mode,
            "config_loaded"
        );
        Self {
            path,
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// Store seeded with a snapshot (no file behind it until `reload`)
    pub fn from_config(path: impl Into<PathBuf>, cfg: RaceConfig) -> Self {
        Self {
            path: path.into(),
            current: ArcSwap::from_pointee(cfg),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current snapshot
    #[inline]
    pub fn snapshot(&self) -> Arc<RaceConfig> {
        self.current.load_full()
    }

    /// Re-read the file. On failure the previous snapshot stays in place.
    pub fn reload(&self) -> Result<Arc<RaceConfig>, ConfigError> {
        let prior = self.snapshot();
        let next = RaceConfig::load_file(&prior, &self.path)?;
        if next != *prior {
            info!(
                path = %self.path.display(),
                opponents = next.opponents.len(),
                earliest_ms = next.earliest_ms,
                latest_ms = next.latest_ms,
                strategy = %next.strategy,
                "config_reloaded"
            );
        }
        let next = Arc::new(next);
        self.current.store(next.clone());
        Ok(next)
    }

    /// Reload on change notifications for the file until `shutdown` flips
    /// to true. Bursts of events within `debounce` are coalesced into one reload.
    ///
    /// The parent directory is watched rather than the file so editors that
    /// save by renaming a temp file over it are still seen.
    pub async fn watch(self: Arc<Self>, debounce: Duration, mut shutdown: watch::Receiver<bool>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = match notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        }) {
            Ok(w) => w,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "config_watch_unavailable");
                return;
            }
        };

        let dir = watch_dir(&self.path);
        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            warn!(dir = %dir.display(), error = %e, "config_watch_unavailable");
            return;
        }
        debug!(path = %self.path.display(), "config_watch_started");

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) if self.is_change(&event) => {}
                    Some(_) => continue,
                    None => return,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(path = %self.path.display(), "config_watch_stopped");
                        return;
                    }
                    continue;
                }
            }

            tokio::time::sleep(debounce).await;
            while rx.try_recv().is_ok() {}

            if let Err(e) = self.reload() {
                warn!(path = %self.path.display(), error = %e, "config_reload_failed, keeping prior snapshot");
            }
        }
    }

    fn is_change(&self, event: &notify::Result<Event>) -> bool {
        match event {
            Ok(event) => {
                matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                    && event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == self.path.file_name())
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "config_watch_error");
                false
            }
        }
    }
}

fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_canonical_keys() {
        let doc = json!({
            "opponents": ["alpha", "beta"],
            "location": "Arcturus",
            "recoveryCode": "s3cret",
            "earliestMs": 1850,
            "latestMs": 2010.5,
            "sweepIncrementMs": 10,
            "strategy": "sweep",
            "detectionMode": "signal",
            "absentBackoffMs": 20,
            "signalWaitMs": 750,
            "maxSignalAgeMs": 1500
        });
        let cfg = RaceConfig::merge_json(&RaceConfig::default(), &doc).unwrap();
        assert_eq!(cfg.opponents, vec!["alpha", "beta"]);
        assert_eq!(cfg.location, "Arcturus");
        assert_eq!(cfg.recovery_code, "s3cret");
        assert_eq!(cfg.earliest_ms, 1850.0);
        assert_eq!(cfg.latest_ms, 2010.5);
        assert_eq!(cfg.sweep_increment_ms, 10.0);
        assert_eq!(cfg.strategy, TimingStrategy::Sweep);
        assert_eq!(cfg.detection_mode, DetectionMode::Signal);
        assert_eq!(cfg.absent_backoff_ms, 20);
        assert_eq!(cfg.signal_wait_ms, 750);
        assert_eq!(cfg.max_signal_age_ms, 1500);
    }

    #[test]
    fn test_legacy_aliases() {
        let doc = json!({
            "rival": "alpha, beta ,,gamma",
            "planetName": "Arcturus",
            "RC": "code",
            "AttackTime": "1900",
            "DefenceTime": 2100,
            "interval": 5
        });
        let cfg = RaceConfig::merge_json(&RaceConfig::default(), &doc).unwrap();
        assert_eq!(cfg.opponents, vec!["alpha", "beta", "gamma"]);
        assert_eq!(cfg.location, "Arcturus");
        assert_eq!(cfg.recovery_code, "code");
        assert_eq!(cfg.earliest_ms, 1900.0);
        assert_eq!(cfg.latest_ms, 2100.0);
        assert_eq!(cfg.sweep_increment_ms, 5.0);
    }

    #[test]
    fn test_invalid_keys_keep_prior_values() {
        let prior = RaceConfig {
            opponents: vec!["alpha".into()],
            earliest_ms: 100.0,
            latest_ms: 200.0,
            ..RaceConfig::default()
        };
        let doc = json!({
            "opponents": 42,
            "earliestMs": -5,
            "latestMs": "soon",
            "strategy": "random",
            "location": "Vega"
        });
        let cfg = RaceConfig::merge_json(&prior, &doc).unwrap();
        assert_eq!(cfg.opponents, vec!["alpha"]);
        assert_eq!(cfg.earliest_ms, 100.0);
        assert_eq!(cfg.latest_ms, 200.0);
        assert_eq!(cfg.strategy, TimingStrategy::Ucb1);
        assert_eq!(cfg.location, "Vega");
    }

    #[test]
    fn test_non_object_rejected() {
        let err = RaceConfig::merge_json(&RaceConfig::default(), &json!([1, 2]));
        assert!(matches!(err, Err(ConfigError::NotAnObject)));
    }

    #[test]
    fn test_store_reload_keeps_prior_on_bad_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"rival": ["alpha"], "AttackTime": 100, "DefenceTime": 150}"#).unwrap();

        let store = ConfigStore::open(&path);
        assert_eq!(store.snapshot().opponents, vec!["alpha"]);

        fs::write(&path, "{ truncated").unwrap();
        assert!(store.reload().is_err());
        assert_eq!(store.snapshot().earliest_ms, 100.0);

        fs::write(&path, r#"{"AttackTime": 120}"#).unwrap();
        let cfg = store.reload().unwrap();
        assert_eq!(cfg.earliest_ms, 120.0);
        assert_eq!(cfg.latest_ms, 150.0);
        assert_eq!(cfg.opponents, vec!["alpha"]);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("nope.json"));
        assert_eq!(*store.snapshot(), RaceConfig::default());
    }

    async fn wait_for_location(store: &ConfigStore, expected: &str) -> bool {
        for _ in 0..300 {
            if store.snapshot().location == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_watch_reloads_rewrite_with_unchanged_mtime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"location": "Vega"}"#).unwrap();
        let original_mtime = fs::metadata(&path).unwrap().modified().unwrap();

        let store = Arc::new(ConfigStore::open(&path));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(store.clone().watch(Duration::from_millis(20), rx));
        // let the watcher register before touching the file
        tokio::time::sleep(Duration::from_millis(200)).await;

        fs::write(&path, r#"{"location": "Rigel"}"#).unwrap();
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(original_mtime)
            .unwrap();

        assert!(wait_for_location(&store, "Rigel").await);
        assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), original_mtime);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_sees_rename_over_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"location": "Vega", "AttackTime": 100}"#).unwrap();

        let store = Arc::new(ConfigStore::open(&path));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(store.clone().watch(Duration::from_millis(20), rx));
        tokio::time::sleep(Duration::from_millis(200)).await;

        // unrelated files in the same directory are ignored
        fs::write(dir.path().join("other.json"), r#"{"location": "Nope"}"#).unwrap();

        let tmp = dir.path().join("config.json.swp");
        fs::write(&tmp, r#"{"location": "Deneb"}"#).unwrap();
        fs::rename(&tmp, &path).unwrap();

        assert!(wait_for_location(&store, "Deneb").await);
        // keys missing from the new file keep their prior values
        assert_eq!(store.snapshot().earliest_ms, 100.0);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
