//! Headless collision simulation driver
//!
//! Loads a JSON configuration, runs it for its configured number of steps
//! and logs periodic statistics.
//!
//! Usage: `headless <config.json> [--steps N] [--log-every N]`

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use orchestrator::create_simulation;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Steps to run when neither the config nor the command line sets a limit.
const DEFAULT_STEPS: u64 = 1_000;

#[derive(Parser, Debug)]
#[command(name = "headless")]
#[command(about = "Run a particle collision simulation without a frontend")]
struct Cli {
    /// Simulation configuration (JSON)
    config: PathBuf,

    /// Number of steps; overrides `max_steps` from the config
    #[arg(long)]
    steps: Option<u64>,

    /// Log statistics every N steps
    #[arg(long, default_value = "100", value_parser = clap::value_parser!(u64).range(1..))]
    log_every: u64,
}

fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "headless=info,orchestrator=info,kernel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Cli::parse();

    let mut sim = match create_simulation(&args.config) {
        Ok(sim) => sim,
        Err(e) => {
            tracing::error!("Failed to create simulation: {e}");
            return ExitCode::FAILURE;
        }
    };

    let steps = args
        .steps
        .or(sim.config().max_steps)
        .unwrap_or(DEFAULT_STEPS);
    tracing::info!(
        "Running '{}' for {} steps on the {} kernel",
        sim.config().name,
        steps,
        sim.kernel().name()
    );

    let start = Instant::now();
    for _ in 0..steps {
        let stats = sim.step();
        let step = sim.step_count();
        if step % args.log_every == 0 || step == steps {
            tracing::info!(
                step,
                sim_time = sim.sim_time(),
                active = stats.active,
                candidates = stats.candidates.stored,
                found = stats.candidates.found,
                saturated = stats.candidates.saturated,
                "step"
            );
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    tracing::info!(
        "Finished {} steps in {:.2}s ({:.1} steps/s), {} particles active",
        steps,
        elapsed,
        steps as f64 / elapsed.max(f64::EPSILON),
        sim.active_count()
    );
    ExitCode::SUCCESS
}
