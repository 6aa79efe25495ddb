use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Args;

use super::{cancel_on_interrupt, connect, emit_report, load_config, ConnectionArgs, OutputFormat, ReportArgs};
use crate::orchestrator::{open_checkpoint, Orchestrator, RunOptions};
use crate::state::{Direction, RunCheckpoint};

/// Restore every controller the checkpoint still records as paused.
#[derive(Debug, Args)]
pub struct ResumeCommand {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Directory holding the run checkpoint.
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    /// Log the restores instead of performing them.
    #[arg(long)]
    pub dry_run: bool,

    #[command(flatten)]
    pub report: ReportArgs,
}

impl ResumeCommand {
    pub async fn run(&self, config_path: Option<&Path>) -> Result<i32> {
        let mut config = load_config(config_path, &self.connection, None)?;
        if self.state_dir.is_some() {
            config.checkpoint.state_dir.clone_from(&self.state_dir);
        }
        if !config.checkpoint.enabled {
            bail!("resume-controllers needs the run checkpoint, which is disabled");
        }
        let dir = config.checkpoint.dir();
        if !RunCheckpoint::file(&dir).exists() {
            bail!("No checkpoint found in {}", dir.display());
        }

        let checkpoint = open_checkpoint(&config.checkpoint, Direction::Start, self.dry_run)?;
        let backends = connect(&config).await?;

        let options = RunOptions {
            dry_run: self.dry_run,
            quiet: self.report.output == OutputFormat::Json,
            ..RunOptions::default()
        };
        let report = Orchestrator::new(backends, config, options, checkpoint, cancel_on_interrupt())?
            .resume_controllers()
            .await;

        emit_report(&report, &self.report)
    }
}
