use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Args;

use super::{cancel_on_interrupt, connect, emit_report, load_config, ConnectionArgs, OutputFormat, ReportArgs};
use crate::model::RoleFilter;
use crate::orchestrator::{open_checkpoint, Orchestrator, RunOptions};
use crate::state::Direction;

/// Show VM power states and volume usage without changing anything.
#[derive(Debug, Args)]
pub struct StatusCommand {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Role groups to list.
    #[arg(long, value_enum, default_value_t = RoleFilter::All)]
    pub roles: RoleFilter,

    /// Directory holding the run checkpoint.
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    #[command(flatten)]
    pub report: ReportArgs,
}

impl StatusCommand {
    pub async fn run(&self, config_path: Option<&Path>) -> Result<i32> {
        let mut config = load_config(config_path, &self.connection, None)?;
        if self.state_dir.is_some() {
            config.checkpoint.state_dir.clone_from(&self.state_dir);
        }
        // Read-only: the checkpoint is inspected, never written.
        let checkpoint = open_checkpoint(&config.checkpoint, Direction::Shutdown, true)?;
        let backends = connect(&config).await?;

        let options = RunOptions {
            roles: self.roles,
            dry_run: true,
            strict: false,
            quiet: self.report.output == OutputFormat::Json,
        };
        let report = Orchestrator::new(backends, config, options, checkpoint, cancel_on_interrupt())?
            .status()
            .await;

        emit_report(&report, &self.report)
    }
}
