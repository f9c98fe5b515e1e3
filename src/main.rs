//! RaceBot - adaptive timing bot for browser-game races
//!
//! Runs one supervised session per config file. Each session owns its own
//! backend connection, timing model file and config watcher.
//!
//! Usage:
//!   racebot --config session1.json --config session2.json
//!
//! Environment:
//!   RACEBOT_CONFIG - Config file(s), comma-separated
//!   RACEBOT_TRANSPORT_URL - Automation backend (default: ws://localhost:8080)
//!   RACEBOT_MODEL_DIR - Directory for per-session model files
//!   RACEBOT_MAX_RETRIES - Consecutive failed recoveries before exit (0 = unlimited)
//!   RUST_LOG - Log filter

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use dotenv::dotenv;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use racebot_backend::{
    config::{ConfigStore, DEFAULT_WATCH_DEBOUNCE_MS},
    detector::{ModeSwitchDetector, OpponentDetector, SignalDetector},
    metrics::RaceMetrics,
    race::{BrowserSession, MonotonicClock, RaceClock, RaceExecutor},
    supervisor::{
        ReconnectPolicy, Supervisor, DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_CAP_MS,
        DEFAULT_MAX_RETRIES,
    },
    timing::{SharedModel, TimingModel, DEFAULT_BIN_SIZE_MS},
    transport::{
        Transport, TransportConfig, WsTransport, DEFAULT_REQUEST_TIMEOUT_MS,
        DEFAULT_TRANSPORT_URL,
    },
};

#[derive(Parser, Debug, Clone)]
#[command(name = "racebot")]
#[command(about = "Adaptive-timing race bot driving a browser-automation backend")]
struct Args {
    /// Race config file; one session per file
    #[arg(long = "config", env = "RACEBOT_CONFIG", value_delimiter = ',', required = true)]
    configs: Vec<PathBuf>,

    /// Automation backend WebSocket URL
    #[arg(long, env = "RACEBOT_TRANSPORT_URL", default_value = DEFAULT_TRANSPORT_URL)]
    transport_url: String,

    /// Explicit model file per session, in config order
    #[arg(long = "model", env = "RACEBOT_MODEL_PATH", value_delimiter = ',')]
    models: Vec<PathBuf>,

    /// Directory for model files not given explicitly
    #[arg(long, env = "RACEBOT_MODEL_DIR", default_value = ".")]
    model_dir: PathBuf,

    /// Directory for the diagnostic screenshot on fatal exit
    #[arg(long, env = "RACEBOT_DIAGNOSTICS_DIR", default_value = ".")]
    diagnostics_dir: PathBuf,

    /// Per-request deadline in milliseconds
    #[arg(long, env = "RACEBOT_REQUEST_TIMEOUT_MS", default_value_t = DEFAULT_REQUEST_TIMEOUT_MS)]
    request_timeout_ms: u64,

    /// Timing bin width in milliseconds
    #[arg(long, env = "RACEBOT_BIN_SIZE_MS", default_value_t = DEFAULT_BIN_SIZE_MS)]
    bin_size_ms: u32,

    /// Consecutive failed recoveries before a session gives up (0 = unlimited)
    #[arg(long, env = "RACEBOT_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Recovery backoff base in milliseconds
    #[arg(long, env = "RACEBOT_BACKOFF_BASE_MS", default_value_t = DEFAULT_BACKOFF_BASE_MS)]
    backoff_base_ms: u64,

    /// Recovery backoff cap in milliseconds
    #[arg(long, env = "RACEBOT_BACKOFF_CAP_MS", default_value_t = DEFAULT_BACKOFF_CAP_MS)]
    backoff_cap_ms: u64,

    /// Quiet period after a config file change before it is re-read
    #[arg(long, env = "RACEBOT_CONFIG_DEBOUNCE_MS", default_value_t = DEFAULT_WATCH_DEBOUNCE_MS)]
    config_debounce_ms: u64,

    /// Emit logs as JSON lines
    #[arg(long, env = "RACEBOT_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    let args = Args::parse();
    init_tracing(args.log_json);

    if !args.models.is_empty() && args.models.len() != args.configs.len() {
        bail!(
            "{} model paths given for {} config files",
            args.models.len(),
            args.configs.len()
        );
    }

    info!(
        sessions = args.configs.len(),
        transport_url = %args.transport_url,
        bin_size_ms = args.bin_size_ms,
        max_retries = args.max_retries,
        "racebot_starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown_requested"),
            Err(e) => warn!(error = %e, "ctrl_c_handler_failed"),
        }
        let _ = shutdown_tx.send(true);
    });

    let mut handles = Vec::with_capacity(args.configs.len());
    for (index, config_path) in args.configs.iter().enumerate() {
        let model_path = args
            .models
            .get(index)
            .cloned()
            .unwrap_or_else(|| args.model_dir.join(format!("ml_model_state_ucb.{}.json", index + 1)));
        let name = session_name(config_path, index);
        let args = args.clone();
        let config_path = config_path.clone();
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let result = run_session(&name, &args, config_path, model_path, shutdown).await;
            (name, result)
        }));
    }

    let mut failed = 0usize;
    for handle in handles {
        match handle.await {
            Ok((name, Ok(()))) => info!(session = %name, "session_finished"),
            Ok((name, Err(e))) => {
                failed += 1;
                error!(session = %name, error = %format!("{:#}", e), "session_failed");
            }
            Err(e) => {
                failed += 1;
                error!(error = %e, "session_task_panicked");
            }
        }
    }

    if failed > 0 {
        bail!("{} session(s) ended with a fatal error", failed);
    }
    info!("racebot_stopped");
    Ok(())
}

async fn run_session(
    name: &str,
    args: &Args,
    config_path: PathBuf,
    model_path: PathBuf,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let store = Arc::new(ConfigStore::open(&config_path));
    tokio::spawn(
        store
            .clone()
            .watch(Duration::from_millis(args.config_debounce_ms), shutdown.clone()),
    );

    let model: SharedModel = Arc::new(Mutex::new(TimingModel::load(&model_path, args.bin_size_ms)));
    {
        let m = model.lock();
        info!(
            session = name,
            model = %model_path.display(),
            total_attempts = m.total_attempts(),
            success_rate = format_args!("{:.3}", m.overall_success_rate()),
            "model_ready"
        );
    }

    let transport_config = TransportConfig {
        url: args.transport_url.clone(),
        request_timeout: Duration::from_millis(args.request_timeout_ms),
    };
    let transport = Arc::new(
        connect_with_retry(name, transport_config, args, shutdown.clone())
            .await
            .context("connect to automation backend")?,
    );

    let browser = Arc::new(BrowserSession::new(transport.clone() as Arc<dyn Transport>));
    let signal = Arc::new(SignalDetector::new(
        transport.subscribe(),
        browser.clone() as Arc<dyn OpponentDetector>,
    ));
    let detector = Arc::new(ModeSwitchDetector::new(browser.clone(), signal));

    let clock: Arc<dyn RaceClock> = Arc::new(MonotonicClock::new());
    let metrics = Arc::new(RaceMetrics::new());
    let executor = RaceExecutor::new(
        detector,
        browser.clone(),
        browser.clone(),
        clock.clone(),
        model.clone(),
        metrics.clone(),
    );

    let policy = ReconnectPolicy::new(args.max_retries, args.backoff_base_ms, args.backoff_cap_ms);
    Supervisor::new(
        name,
        store,
        executor,
        browser,
        clock,
        model,
        metrics,
        policy,
        shutdown,
    )
    .with_diagnostics_dir(&args.diagnostics_dir)
    .run()
    .await?;

    Ok(())
}

/// Initial connect, with the same backoff schedule as session recovery
async fn connect_with_retry(
    name: &str,
    config: TransportConfig,
    args: &Args,
    mut shutdown: watch::Receiver<bool>,
) -> Result<WsTransport> {
    let mut policy = ReconnectPolicy::new(args.max_retries, args.backoff_base_ms, args.backoff_cap_ms);
    loop {
        match WsTransport::connect(config.clone()).await {
            Ok(t) => return Ok(t),
            Err(e) if policy.exhausted() => return Err(e.into()),
            Err(e) => {
                let delay = policy.next_backoff();
                warn!(
                    session = name,
                    error = %e,
                    attempt = policy.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "transport_connect_failed"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.wait_for(|stop| *stop) => bail!("shutdown before connect"),
                }
            }
        }
    }
}

fn session_name(config_path: &Path, index: usize) -> String {
    config_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("session{}", index + 1))
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "racebot_backend=debug,racebot=info".into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
