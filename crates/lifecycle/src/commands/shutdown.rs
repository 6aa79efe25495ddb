use std::path::Path;

use anyhow::Result;
use clap::Args;

use super::{cancel_on_interrupt, connect, emit_report, load_config, run_options, ConnectionArgs, RunArgs};
use crate::orchestrator::{open_checkpoint, Orchestrator};
use crate::state::Direction;

/// Safely shut the cluster down.
#[derive(Debug, Args)]
pub struct ShutdownCommand {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(flatten)]
    pub run: RunArgs,
}

impl ShutdownCommand {
    /// Pause controllers, drain storage workloads, then stop workers and masters.
    ///
    /// Returns the process exit code.
    pub async fn run(&self, config_path: Option<&Path>) -> Result<i32> {
        let config = load_config(config_path, &self.connection, Some(&self.run))?;
        let checkpoint = open_checkpoint(&config.checkpoint, Direction::Shutdown, self.run.dry_run)?;
        let backends = connect(&config).await?;

        let report = Orchestrator::new(
            backends,
            config,
            run_options(&self.run),
            checkpoint,
            cancel_on_interrupt(),
        )?
        .shutdown()
        .await;

        emit_report(&report, &self.run.report)
    }
}
