use std::path::PathBuf;
use std::sync::mpsc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use trackmgr::service::{ServiceOptions, TrackService};
use trackmgr::sim::{SimConfig, TrackSimulator};
use trackmgr::sink::LogSink;

/// Real-time multi-target track management service.
#[derive(Parser)]
#[command(name = "trackmgr", about)]
struct Cli {
    /// Path to the track manager configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Feed the service with synthetic track traffic.
    #[arg(long)]
    simulate: bool,

    /// Number of synthetic tracks when --simulate is set.
    #[arg(long, default_value_t = 30)]
    sim_tracks: u32,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} ({}/{})",
            RELEASE,
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("trackmgr {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Config is required for the main service run.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let service = TrackService::new(&config_path, ServiceOptions::default(), Box::new(LogSink))
        .with_context(|| format!("starting service with config {}", config_path.display()))?;

    tracing::info!(version = version::RELEASE, "trackmgr started");

    let mut simulator = if cli.simulate {
        let sim_config = SimConfig {
            num_tracks: cli.sim_tracks,
            ..SimConfig::default()
        };
        Some(
            TrackSimulator::start(service.scheduler(), sim_config)
                .context("starting track simulator")?,
        )
    } else {
        None
    };

    // Block until SIGINT, then shut down in dependency order.
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .context("setting signal handler")?;

    let _ = shutdown_rx.recv();
    tracing::info!("received interrupt, shutting down");

    if let Some(sim) = simulator.as_mut() {
        sim.stop();
    }
    service.stop();

    tracing::info!("trackmgr stopped");

    Ok(())
}
