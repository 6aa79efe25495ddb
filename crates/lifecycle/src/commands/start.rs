use std::path::Path;

use anyhow::Result;
use clap::Args;

use super::{cancel_on_interrupt, connect, emit_report, load_config, run_options, ConnectionArgs, RunArgs};
use crate::orchestrator::{open_checkpoint, Orchestrator};
use crate::state::Direction;

/// Start the cluster after a shutdown.
#[derive(Debug, Args)]
pub struct StartCommand {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(flatten)]
    pub run: RunArgs,
}

impl StartCommand {
    /// Start masters then workers, wait for the API, restore workloads and
    /// controllers recorded by the last shutdown.
    ///
    /// Returns the process exit code.
    pub async fn run(&self, config_path: Option<&Path>) -> Result<i32> {
        let config = load_config(config_path, &self.connection, Some(&self.run))?;
        let checkpoint = open_checkpoint(&config.checkpoint, Direction::Start, self.run.dry_run)?;
        let backends = connect(&config).await?;

        let report = Orchestrator::new(
            backends,
            config,
            run_options(&self.run),
            checkpoint,
            cancel_on_interrupt(),
        )?
        .start()
        .await;

        emit_report(&report, &self.run.report)
    }
}
