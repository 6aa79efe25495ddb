//! Cluster lifecycle CLI.
//!
//! Runbook entry points for taking a Proxmox-hosted Kubernetes cluster down
//! safely and bringing it back up.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use cluster_lifecycle::commands::{ResumeCommand, ShutdownCommand, StartCommand, StatusCommand};
use cluster_lifecycle::ui;

/// Exit code for usage and configuration errors.
const EXIT_USAGE: u8 = 2;

/// Safe shutdown and startup for a Kubernetes cluster on Proxmox VMs.
#[derive(Parser)]
#[command(
    name = "cluster-lifecycle",
    version,
    about = "Safely shut down and start a Kubernetes cluster on Proxmox",
    long_about = "Safely shut down and start a Kubernetes cluster on Proxmox.\n\n\
                  Shutdown pauses GitOps controllers, drains workloads holding Longhorn\n\
                  volumes, then stops worker VMs before master VMs. Start reverses it.\n\n\
                  Re-running a command is safe: resources already transitioned are skipped."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log line format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Configuration file (TOML).
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Pause controllers, drain storage workloads, and stop all VMs.
    ShutdownCluster(ShutdownCommand),

    /// Start all VMs, wait for the cluster, and restore workloads and controllers.
    StartCluster(StartCommand),

    /// Show VM power states and volume usage.
    Status(StatusCommand),

    /// Restore controllers left paused by an earlier run.
    ResumeControllers(ResumeCommand),
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("info,cluster_lifecycle=debug")
        } else {
            EnvFilter::new("warn,cluster_lifecycle=info")
        }
    });

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config = cli.config.as_deref();
    match cli.command {
        Commands::ShutdownCluster(cmd) => cmd.run(config).await,
        Commands::StartCluster(cmd) => cmd.run(config).await,
        Commands::Status(cmd) => cmd.run(config).await,
        Commands::ResumeControllers(cmd) => cmd.run(config).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match run(cli).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            ui::print_error(&format!("{e:#}"));
            ExitCode::from(EXIT_USAGE)
        }
    }
}
