//! Timing Model Inspection Tool
//!
//! Reads a persisted timing-model file and prints what the bandit has learned.
//!
//! Usage:
//!   model_inspect --model ml_model_state_ucb.1.json summary
//!   model_inspect --model ml_model_state_ucb.1.json scores --start 1800 --end 2100
//!   model_inspect --model ml_model_state_ucb.json export --output upgraded.json

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use racebot_backend::timing::{load_state, save_state, TimingModel, DEFAULT_BIN_SIZE_MS};

/// Inspect a persisted UCB1 timing model
#[derive(Parser, Debug)]
#[command(name = "model_inspect")]
#[command(about = "Print per-bin statistics and overhead averages of a timing model file")]
struct Cli {
    /// Path to the model file
    #[arg(short, long, env = "RACEBOT_MODEL_PATH")]
    model: PathBuf,

    /// Bin width in milliseconds (default: the width stored in the file)
    #[arg(long)]
    bin_size_ms: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Per-bin table, overall success rate and overhead averages
    Summary,

    /// UCB1 scores over a window and the bin that would be picked next
    Scores {
        #[arg(long)]
        start: f64,
        #[arg(long)]
        end: f64,
    },

    /// Write the state back in the current versioned layout
    Export {
        /// Output file path (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let state = load_state(&cli.model)
        .with_context(|| format!("Failed to read model file: {:?}", cli.model))?;
    let Some(state) = state else {
        bail!("model file does not exist: {:?}", cli.model);
    };
    let bin_size_ms = cli
        .bin_size_ms
        .or(state.bin_size_ms)
        .unwrap_or(DEFAULT_BIN_SIZE_MS);

    match cli.command {
        Commands::Summary => {
            let model = TimingModel::load(&cli.model, bin_size_ms);
            println!("Model: {:?}", cli.model);
            println!("Version: {}", state.version);
            println!("Bin size: {} ms", bin_size_ms);
            println!();
            println!("{:>10} {:>10} {:>10} {:>8}", "bin_ms", "attempts", "successes", "rate");
            println!("{}", "-".repeat(41));
            for (bin, stats) in model.bins() {
                println!(
                    "{:>10} {:>10} {:>10} {:>7.1}%",
                    bin,
                    stats.attempts,
                    stats.successes,
                    stats.success_rate() * 100.0
                );
            }
            println!();
            println!("Total attempts:       {}", model.total_attempts());
            println!("Overall success rate: {:.1}%", model.overall_success_rate() * 100.0);
            let overhead = model.overhead();
            println!("Avg pre-commit check: {:.2} ms", overhead.pre_commit_check_ms);
            println!("Avg commit action:    {:.2} ms", overhead.commit_action_ms);
        }
        Commands::Scores { start, end } => {
            let model = TimingModel::load(&cli.model, bin_size_ms);
            let scores = model.scores(start, end);
            if scores.is_empty() {
                bail!("window [{}, {}] has no candidate bins", start, end);
            }
            println!("{:>10} {:>10} {:>10} {:>10}", "bin_ms", "attempts", "successes", "ucb");
            println!("{}", "-".repeat(43));
            for s in &scores {
                println!(
                    "{:>10} {:>10} {:>10} {:>10.4}",
                    s.bin, s.stats.attempts, s.stats.successes, s.score
                );
            }
            println!();
            println!("Next prediction: {} ms", model.predict(start, end));
        }
        Commands::Export { output } => match output {
            Some(path) => {
                save_state(&path, &state)
                    .with_context(|| format!("Failed to write model file: {:?}", path))?;
                println!("Wrote {:?}", path);
            }
            None => {
                println!("{}", serde_json::to_string_pretty(&state)?);
            }
        },
    }

    Ok(())
}
