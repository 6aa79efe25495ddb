//! CLI subcommands and the wiring they share.

pub mod resume;
pub mod shutdown;
pub mod start;
pub mod status;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::KubeCluster;
use crate::config::LifecycleConfig;
use crate::controllers::{ArgoApplications, OperatorResources, ReconcilingController};
use crate::hypervisor::Proxmox;
use crate::model::RoleFilter;
use crate::orchestrator::{Backends, RunOptions};
use crate::report::StatusReport;
use crate::ui;

pub use resume::ResumeCommand;
pub use shutdown::ShutdownCommand;
pub use start::StartCommand;
pub use status::StatusCommand;

/// How the final report is printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Colored summary.
    #[default]
    Human,
    /// JSON on stdout; progress output is suppressed.
    Json,
}

/// Control-plane endpoints and credentials.
#[derive(Debug, Clone, Args)]
pub struct ConnectionArgs {
    /// Proxmox VE API URL (or set `PVE_URL` env var).
    #[arg(long, env = "PVE_URL")]
    pub pve_url: Option<String>,

    /// Proxmox API token id, e.g. `root@pam!lifecycle` (or set `PVE_TOKEN_ID`).
    #[arg(long, env = "PVE_TOKEN_ID")]
    pub pve_token_id: Option<String>,

    /// Proxmox API token secret (or set `PVE_TOKEN_SECRET`).
    #[arg(long, env = "PVE_TOKEN_SECRET", hide_env_values = true)]
    pub pve_token_secret: Option<String>,

    /// Accept self-signed Proxmox certificates.
    #[arg(long)]
    pub insecure: bool,

    /// Kubeconfig path (or set `KUBECONFIG`).
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context.
    #[arg(long)]
    pub context: Option<String>,
}

/// Switches shared by `shutdown-cluster` and `start-cluster`.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Role groups to transition.
    #[arg(long, value_enum, default_value_t = RoleFilter::All)]
    pub roles: RoleFilter,

    /// Log every mutation instead of performing it.
    #[arg(long)]
    pub dry_run: bool,

    /// Abort before any VM transition if a volume is still in use.
    #[arg(long)]
    pub strict: bool,

    /// Poll interval in seconds.
    #[arg(long, value_name = "SECS")]
    pub poll_interval: Option<u64>,

    /// Override every max-wait budget, in seconds.
    #[arg(long, value_name = "SECS")]
    pub max_wait: Option<u64>,

    /// Do not read or write the run checkpoint.
    #[arg(long)]
    pub no_checkpoint: bool,

    /// Directory for the run checkpoint.
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    #[command(flatten)]
    pub report: ReportArgs,
}

/// Where the report goes.
#[derive(Debug, Clone, Args)]
pub struct ReportArgs {
    /// Report format on stdout.
    #[arg(long, value_enum, default_value_t = OutputFormat::Human)]
    pub output: OutputFormat,

    /// Also write the JSON report to this file.
    #[arg(long, value_name = "FILE")]
    pub report_json: Option<PathBuf>,
}

/// Load the config file and apply CLI overrides.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the result is invalid.
pub fn load_config(
    path: Option<&Path>,
    connection: &ConnectionArgs,
    run: Option<&RunArgs>,
) -> Result<LifecycleConfig> {
    let mut config = LifecycleConfig::load(path)?;

    if let Some(ref url) = connection.pve_url {
        config.hypervisor.url.clone_from(url);
    }
    if let Some(ref id) = connection.pve_token_id {
        config.hypervisor.token_id.clone_from(id);
    }
    if let Some(ref secret) = connection.pve_token_secret {
        config.hypervisor.token_secret.clone_from(secret);
    }
    if connection.insecure {
        config.hypervisor.insecure_tls = true;
    }
    if connection.kubeconfig.is_some() {
        config.cluster.kubeconfig.clone_from(&connection.kubeconfig);
    }
    if connection.context.is_some() {
        config.cluster.context.clone_from(&connection.context);
    }

    if let Some(run) = run {
        apply_run_overrides(&mut config, run);
    }

    config.validate()?;
    Ok(config)
}

fn apply_run_overrides(config: &mut LifecycleConfig, run: &RunArgs) {
    if let Some(secs) = run.poll_interval {
        config.timing.poll_interval_secs = secs;
    }
    if let Some(secs) = run.max_wait {
        config.timing.drain_max_wait_secs = secs;
        config.timing.power_max_wait_secs = Some(secs);
        config.timing.api_ready_max_wait_secs = secs;
    }
    if run.no_checkpoint {
        config.checkpoint.enabled = false;
    }
    if run.state_dir.is_some() {
        config.checkpoint.state_dir.clone_from(&run.state_dir);
    }
}

/// Run options from CLI switches.
#[must_use]
pub fn run_options(run: &RunArgs) -> RunOptions {
    RunOptions {
        roles: run.roles,
        dry_run: run.dry_run,
        strict: run.strict,
        quiet: run.report.output == OutputFormat::Json,
    }
}

/// Connect to both control planes and build the controller handlers.
///
/// # Errors
///
/// Returns an error if either client cannot be created.
pub async fn connect(config: &LifecycleConfig) -> Result<Backends> {
    let hv = &config.hypervisor;
    let proxmox = Proxmox::new(&hv.url, &hv.token_id, &hv.token_secret, hv.insecure_tls)
        .context("Failed to create Proxmox client")?;

    let cluster = KubeCluster::connect(
        config.cluster.kubeconfig.as_deref(),
        config.cluster.context.as_deref(),
        config.storage.engine_namespace.clone(),
    )
    .await
    .context("Failed to create Kubernetes client")?;

    let mut controllers: Vec<Arc<dyn ReconcilingController>> = Vec::new();
    if config.controllers.argocd {
        controllers.push(Arc::new(ArgoApplications::new(
            cluster.client(),
            config.controllers.argocd_namespace.clone(),
        )));
    }
    for operator in &config.controllers.operators {
        controllers.push(Arc::new(OperatorResources::new(cluster.client(), operator)));
    }
    info!(controller_kinds = controllers.len(), "Connected to control planes");

    Ok(Backends {
        hypervisor: Arc::new(proxmox),
        cluster: Arc::new(cluster),
        controllers,
    })
}

/// A token cancelled on Ctrl-C or SIGTERM.
///
/// The SIGTERM listener is registered before this returns.
#[must_use]
pub fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let terminate = terminate_signal();
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            () = ctrl_c => warn!("Interrupt received, cancelling run"),
            () = terminate => warn!("SIGTERM received, cancelling run"),
        }
        trigger.cancel();
    });
    cancel
}

#[cfg(unix)]
fn terminate_signal() -> impl Future<Output = ()> + Send + 'static {
    use tokio::signal::unix::{signal, SignalKind};

    let listener = signal(SignalKind::terminate());
    async move {
        match listener {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
fn terminate_signal() -> impl Future<Output = ()> + Send + 'static {
    std::future::pending()
}

/// Print and optionally persist the report; returns the process exit code.
///
/// # Errors
///
/// Returns an error if the JSON report cannot be produced or written.
pub fn emit_report(report: &StatusReport, args: &ReportArgs) -> Result<i32> {
    match args.output {
        OutputFormat::Human => report.print(),
        OutputFormat::Json => println!("{}", report.to_json().context("Failed to render report")?),
    }
    if let Some(ref path) = args.report_json {
        report.write_json(path)?;
        if args.output == OutputFormat::Human {
            ui::print_info(&format!("Report written to {}", path.display()));
        }
    }
    Ok(report.exit_code())
}
