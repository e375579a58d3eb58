//! CLI entry point: loads configuration, builds an `Engine`, and drives
//! it for a fixed number of steps (or until interrupted).

use clap::Parser;
use sentrymesh::{init_tracing, Engine, EngineError, EngineOptions, SharedEventSink, TracingEventSink};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "sentrymesh", about = "Decentralized anomaly-detection consensus engine")]
struct Cli {
    /// Number of peer agents to simulate.
    #[arg(long, env = "APP_NUM_AGENTS")]
    agents: Option<usize>,

    /// Number of steps to run before exiting.
    #[arg(long, default_value_t = 100, env = "APP_STEPS")]
    steps: u64,

    /// Force the parallel scheduling strategy regardless of the configured threshold.
    #[arg(long, conflicts_with = "sequential")]
    parallel: bool,

    /// Force the sequential scheduling strategy regardless of the configured threshold.
    #[arg(long, conflicts_with = "parallel")]
    sequential: bool,

    /// Optional TOML configuration file, layered under defaults and above `APP_*` env vars.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Deterministic RNG seed; overrides the configured seed.
    #[arg(long, env = "APP_SEED")]
    seed: Option<u64>,

    /// Print final engine stats as JSON instead of a structured log line.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();

    let mut options = match EngineOptions::load(cli.config.as_deref()) {
        Ok(opts) => opts,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::from(2);
        }
    };

    if let Some(agents) = cli.agents {
        options.num_agents = agents;
    }
    if let Some(seed) = cli.seed {
        options.seed = seed;
    }
    if cli.parallel {
        options.parallel_enabled = true;
        options.parallel_threshold = 0;
    }
    if cli.sequential {
        options.parallel_enabled = false;
    }

    if let Err(e) = options.validate() {
        error!(error = %e, "invalid configuration");
        return ExitCode::from(2);
    }

    let event_sink: SharedEventSink = Arc::new(TracingEventSink::new());

    let mut engine = match Engine::new(&options, event_sink) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "failed to build engine");
            return ExitCode::from(2);
        }
    };

    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping at next step boundary");
            cancel.cancel();
        }
    });

    let result = engine.run(cli.steps).await;
    let _ = engine.close().await;

    match result {
        Ok(()) => {
            let stats = engine.stats();
            if cli.json {
                match serde_json::to_string(&stats) {
                    Ok(rendered) => println!("{rendered}"),
                    Err(e) => error!(error = %e, "failed to render stats as json"),
                }
            } else {
                info!(?stats, "engine run complete");
            }
            ExitCode::SUCCESS
        }
        Err(EngineError::Canceled) => {
            info!("run interrupted by cancellation");
            ExitCode::from(130)
        }
        Err(e) => {
            error!(error = %e, "engine run failed");
            ExitCode::from(1)
        }
    }
}
