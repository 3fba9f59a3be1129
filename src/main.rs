mod config;
mod gpu;
mod policy;
mod queue;
mod runpod;
mod signals;
mod state;
mod terminate;
mod watchdog;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// A watchdog daemon for rented RunPod GPU pods: poll GPU utilization and
/// the experiment queue, track idle streaks, and terminate (or stop) the
/// pod once it has been idle long enough to be wasting money.
#[derive(Parser, Debug)]
#[command(name = "runpod-watchdog", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "watchdog.toml")]
    config: PathBuf,

    /// State snapshot file, rewritten every poll cycle
    #[arg(long, default_value = "runpod_watchdog_state.json")]
    state_file: PathBuf,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Print the last state snapshot and exit
    #[arg(long)]
    status: bool,

    /// Extra logging (per-sample details, retry decisions)
    #[arg(short, long)]
    verbose: bool,

    /// Suppress per-cycle logging, only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    if cli.status {
        match std::fs::read_to_string(&cli.state_file) {
            Ok(contents) => println!("{contents}"),
            Err(_) => println!("No state snapshot at {} yet.", cli.state_file.display()),
        }
        return ExitCode::SUCCESS;
    }

    // INIT: the one fatal startup condition.
    let config = match config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "fatal: invalid configuration");
            return ExitCode::from(2);
        }
    };

    if cli.dry_run {
        println!("runpod-watchdog v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("  enabled                    = {}", config.enabled);
        println!("  idle_enabled               = {}", config.idle_enabled);
        println!("  queue_empty_enabled        = {}", config.queue_empty_enabled);
        println!(
            "  terminate_on_empty_queue   = {}",
            config.terminate_on_empty_queue
        );
        println!("  terminate_all              = {}", config.terminate_all);
        println!("  idle_seconds               = {}", config.idle_seconds);
        println!(
            "  queue_empty_seconds        = {}",
            config.queue_empty_seconds()
        );
        println!("  poll_seconds               = {}", config.poll_seconds);
        println!("  gpu_util_threshold         = {}", config.gpu_util_threshold);
        println!(
            "  gpu_mem_fraction_threshold = {}",
            config.gpu_mem_fraction_threshold
        );
        println!("  terminate_mode             = {}", config.terminate_mode);
        println!("  db_path                    = {}", config.db_path().display());
        println!(
            "  api_key                    = {}",
            if config.api_key.is_empty() {
                "(not set)"
            } else {
                "(set)"
            }
        );
        println!("Dry run mode — config validated, not running.");
        return ExitCode::SUCCESS;
    }

    if config.api_key.is_empty() {
        tracing::error!(error = %config::ConfigError::MissingApiKey, "fatal: invalid configuration");
        return ExitCode::from(2);
    }

    let mut shutdown = match signals::ShutdownSignal::install() {
        Ok(shutdown) => shutdown,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    let env_pod_id = std::env::var("RUNPOD_POD_ID")
        .ok()
        .filter(|id| !id.is_empty());
    let client = runpod::RunpodClient::new(&config.api_key);
    let watchdog = watchdog::WatchdogLoop::new(config, client, env_pod_id, cli.state_file);

    match watchdog.run(&mut shutdown).await {
        watchdog::LoopOutcome::Shutdown => tracing::info!("watchdog stopped by signal"),
        watchdog::LoopOutcome::Terminated => {
            tracing::info!("pod termination handed off, watchdog exiting")
        }
    }
    ExitCode::SUCCESS
}
