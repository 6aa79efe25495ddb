//! Top-level sequencer for `shutdown-cluster` and `start-cluster`.
//!
//! Shutdown: preflight (reachability, access review, inventory), pause
//! controllers, drain storage workloads, verify, stop workers, stop masters.
//! Start: preflight, start masters, start workers, wait for the cluster API,
//! restore workloads, resume controllers.
//!
//! Components accumulate their errors into the report; this module alone
//! decides whether an error aborts the run. Once controllers have been touched,
//! every abort path (error, cancellation, panic) resumes them before returning.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cluster::{ClusterApi, SHUTDOWN_ACCESS};
use crate::config::{CheckpointConfig, LifecycleConfig};
use crate::controllers::{PauseManager, ReconcilingController};
use crate::drain::{Drainer, NamespacePolicy};
use crate::error::LifecycleError;
use crate::hypervisor::Hypervisor;
use crate::inventory::{InventoryResolver, TagSelector, VmInventory};
use crate::model::{PowerState, Role, RoleFilter};
use crate::power::PowerSequencer;
use crate::report::{RestoreOutcome, StatusReport};
use crate::state::{Direction, RunCheckpoint, RunState};
use crate::ui;
use crate::wait::{poll_until, WaitOutcome};

/// Control-plane clients a run talks to.
#[derive(Clone)]
pub struct Backends {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub cluster: Arc<dyn ClusterApi>,
    pub controllers: Vec<Arc<dyn ReconcilingController>>,
}

/// Per-invocation switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub roles: RoleFilter,
    /// Log every mutation instead of performing it.
    pub dry_run: bool,
    /// Abort before any VM transition if a volume is still in use or errored.
    pub strict: bool,
    /// Suppress console progress output.
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Shutdown,
    Start,
    Status,
    ResumeControllers,
}

/// Open the checkpoint for a run.
///
/// Loads an existing checkpoint when persistence is enabled, otherwise starts
/// an in-memory one. Dry runs read but never write.
///
/// # Errors
///
/// Returns an error if an existing checkpoint cannot be parsed.
pub fn open_checkpoint(
    config: &CheckpointConfig,
    direction: Direction,
    dry_run: bool,
) -> Result<RunCheckpoint, LifecycleError> {
    if !config.enabled {
        return Ok(RunCheckpoint::in_memory(direction));
    }

    let dir = config.dir();
    let mut checkpoint =
        RunCheckpoint::load(&dir)?.unwrap_or_else(|| RunCheckpoint::new(&dir, direction));
    checkpoint.direction = direction;
    if dry_run {
        checkpoint.detach();
    }
    Ok(checkpoint)
}

/// Drives one lifecycle run.
pub struct Orchestrator {
    hypervisor: Arc<dyn Hypervisor>,
    cluster: Arc<dyn ClusterApi>,
    resolver: InventoryResolver,
    pause: PauseManager,
    drainer: Drainer,
    power: PowerSequencer,
    config: LifecycleConfig,
    options: RunOptions,
    checkpoint: RunCheckpoint,
    report: StatusReport,
    cancel: CancellationToken,
    /// Controllers may have been touched; aborts must resume them.
    controllers_touched: bool,
}

impl Orchestrator {
    /// Wire up every component from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        backends: Backends,
        config: LifecycleConfig,
        options: RunOptions,
        checkpoint: RunCheckpoint,
        cancel: CancellationToken,
    ) -> Result<Self, LifecycleError> {
        config.validate()?;
        let ingress_pattern = Regex::new(&config.storage.ingress_pattern)
            .map_err(|e| LifecycleError::Config(format!("invalid ingress pattern: {e}")))?;

        let resolver = InventoryResolver::new(
            backends.hypervisor.clone(),
            backends.cluster.clone(),
            TagSelector::from_config(&config.hypervisor),
        );
        let drainer = Drainer::new(
            backends.cluster.clone(),
            NamespacePolicy {
                infra_namespace: config.storage.infra_namespace.clone(),
                ingress_pattern,
            },
            config.timing.drain_policy(),
            config.timing.drain_parallelism,
            options.dry_run,
        );
        let power = PowerSequencer::new(
            backends.hypervisor.clone(),
            config.timing.clone(),
            options.dry_run,
        );

        Ok(Self {
            hypervisor: backends.hypervisor,
            cluster: backends.cluster,
            resolver,
            pause: PauseManager::new(backends.controllers, options.dry_run),
            drainer,
            power,
            report: StatusReport::new(Some(checkpoint.direction), options.dry_run, options.strict),
            config,
            options,
            checkpoint,
            cancel,
            controllers_touched: false,
        })
    }

    /// Take the cluster down. Always returns a report.
    pub async fn shutdown(self) -> StatusReport {
        self.execute(Operation::Shutdown).await
    }

    /// Bring the cluster up. Always returns a report.
    pub async fn start(self) -> StatusReport {
        self.execute(Operation::Start).await
    }

    /// Read-only report of VM power states and volume usage.
    pub async fn status(mut self) -> StatusReport {
        self.report.direction = None;
        self.execute(Operation::Status).await
    }

    /// Restore every controller still recorded as paused in the checkpoint.
    pub async fn resume_controllers(mut self) -> StatusReport {
        self.report.direction = None;
        self.execute(Operation::ResumeControllers).await
    }

    async fn execute(mut self, op: Operation) -> StatusReport {
        if !self.options.quiet && matches!(op, Operation::Shutdown | Operation::Start) {
            ui::print_banner(self.checkpoint.direction, self.options.dry_run);
        }

        let result = match AssertUnwindSafe(self.dispatch(op)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "run step panicked".to_string());
                Err(LifecycleError::Internal(message))
            }
        };

        match result {
            Ok(()) => self.enter(RunState::Done),
            Err(e) => self.abort(e).await,
        }
        self.report.finish();
        self.report
    }

    async fn dispatch(&mut self, op: Operation) -> Result<(), LifecycleError> {
        match op {
            Operation::Shutdown => self.run_shutdown().await,
            Operation::Start => self.run_start().await,
            Operation::Status => self.run_status().await,
            Operation::ResumeControllers => self.run_resume().await,
        }
    }

    async fn abort(&mut self, err: LifecycleError) {
        error!(state = ?self.report.final_state, error = %err, "Run aborted");
        self.report.error(err.to_string());
        if let Err(e) = self.checkpoint.record_error(&err.to_string()) {
            self.report.error(e.to_string());
        }

        if self.controllers_touched {
            if !self.options.quiet {
                ui::print_warning("Resuming controllers before exit");
            }
            self.resume_all().await;
        }
        self.enter(RunState::Aborted);
    }

    fn enter(&mut self, state: RunState) {
        info!(state = ?state, "{}", state.description());
        if !self.options.quiet {
            ui::print_state(state);
        }
        self.report.enter(state);
        if let Err(e) = self.checkpoint.set_state(state) {
            warn!(error = %e, "Failed to save checkpoint");
            self.report.warn(e.to_string());
        }
    }

    fn check_cancel(&self) -> Result<(), LifecycleError> {
        if self.cancel.is_cancelled() {
            Err(LifecycleError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn save_checkpoint(&mut self) -> Result<(), LifecycleError> {
        self.checkpoint.save()
    }

    async fn resolve_inventory(&mut self) -> Result<VmInventory, LifecycleError> {
        let inventory = self.resolver.resolve_vms(self.options.roles).await?;
        if inventory.is_empty() {
            return Err(LifecycleError::Discovery(
                "no managed VMs matched the role filter".to_string(),
            ));
        }
        self.report.inventory = inventory.iter().cloned().collect();
        Ok(inventory)
    }

    async fn warn_unready_nodes(&mut self) {
        match self.cluster.node_readiness().await {
            Ok(nodes) => {
                for node in nodes.iter().filter(|n| !n.ready) {
                    warn!(node = %node.name, "Node is not Ready");
                    self.report.warn(format!("node {} is not Ready", node.name));
                }
            }
            Err(e) => self.report.warn(format!("could not read node readiness: {e}")),
        }
    }

    /// Fail preflight when the identity lacks access a shutdown depends on.
    /// Reviews that cannot be evaluated only warn.
    async fn verify_access(&mut self) -> Result<(), LifecycleError> {
        let mut denied = Vec::new();
        for check in SHUTDOWN_ACCESS {
            match self.cluster.can_i(check).await {
                Ok(true) => {}
                Ok(false) => denied.push(check.to_string()),
                Err(e) => {
                    warn!(check = %check, error = %e, "Access review failed");
                    self.report
                        .warn(format!("could not verify access to {check}: {e}"));
                }
            }
        }
        if denied.is_empty() {
            return Ok(());
        }

        let err = LifecycleError::Discovery(format!("missing permissions: {}", denied.join(", ")));
        if self.options.dry_run {
            self.report.warn(format!("[DRY-RUN] shutdown would abort: {err}"));
            return Ok(());
        }
        Err(err)
    }

    async fn resume_all(&mut self) {
        let summary = self.pause.resume_all(&mut self.checkpoint.controllers).await;
        let left = self.checkpoint.controllers.pending();
        for failure in &summary.failures {
            self.report.warn(format!(
                "controller {} left paused: {}",
                failure.controller, failure.error
            ));
        }
        self.report.record_resume(summary, left);
        if let Err(e) = self.save_checkpoint() {
            self.report.warn(e.to_string());
        }
    }

    async fn run_shutdown(&mut self) -> Result<(), LifecycleError> {
        self.enter(RunState::Preflight);
        self.hypervisor.ping().await?;
        let version = self.cluster.server_version().await?;
        info!(version = %version, "Cluster API reachable");
        if self.config.policy.verify_access {
            self.verify_access().await?;
        }

        let inventory = self.resolve_inventory().await?;
        let volumes = self
            .resolver
            .resolve_volumes(&self.config.storage.storage_class)
            .await?;
        self.warn_unready_nodes().await;
        self.check_cancel()?;

        self.controllers_touched = true;
        let summary = self.pause.pause_all(&mut self.checkpoint.controllers).await;
        self.report.record_pause(summary);
        self.enter(RunState::ControllersPaused);
        self.check_cancel()?;

        self.enter(RunState::Draining);
        let plan = self.drainer.plan(&volumes).await;
        for target in plan.targets() {
            self.checkpoint.record_scaled(target);
        }
        self.save_checkpoint()?;

        let drain = self.drainer.execute(&plan, &self.cancel).await;
        let cancelled = drain.cancelled;
        let blocking = drain.still_in_use() + drain.errored();
        self.report.record_drain(drain);
        if cancelled {
            return Err(LifecycleError::Cancelled);
        }

        self.enter(RunState::DrainVerified);
        if blocking > 0 && self.options.strict {
            let err = LifecycleError::DrainTimeout {
                subject: format!("{blocking} volume(s)"),
                waited: self.config.timing.drain_policy().max_wait,
            };
            if !self.options.dry_run {
                return Err(err);
            }
            self.report.warn(format!("[DRY-RUN] strict mode would abort: {err}"));
        }

        self.enter(RunState::VmsTransitioning);
        for role in [Role::Worker, Role::Master] {
            let group = inventory.group(role);
            if group.is_empty() {
                continue;
            }
            info!(role = %role, vms = group.len(), "Stopping role group");
            let result = self.power.shutdown_group(group, &self.cancel).await;
            let ok = result.is_success();
            let cancelled = result.cancelled;
            let failed: Vec<String> = result
                .failures()
                .map(|o| format!("{} ({})", o.name, o.id))
                .collect();
            self.report.record_group(result);

            if cancelled {
                return Err(LifecycleError::Cancelled);
            }
            if !ok {
                return Err(LifecycleError::PowerTransition {
                    vm: failed.join(", "),
                    target: PowerState::Stopped,
                    reason: format!("{role} group did not stop"),
                });
            }
        }

        // Saved controller state only outlives this process in a persisted checkpoint.
        let resume_now = self.config.policy.resume_controllers_after_shutdown
            || (self.checkpoint.path().is_none() && !self.options.dry_run);
        if resume_now && !self.config.policy.resume_controllers_after_shutdown {
            warn!("No persisted checkpoint; resuming controllers now");
            self.report
                .warn("checkpoint disabled: controllers resumed after shutdown");
            let workloads = self.checkpoint.pending_workloads().count();
            if workloads > 0 {
                self.report.warn(format!(
                    "checkpoint disabled: {workloads} drained workload(s) will not be restored on start"
                ));
            }
        }

        if resume_now {
            self.resume_all().await;
        } else {
            let left = self.checkpoint.controllers.pending();
            self.report.controllers.left_paused = left;
            if left > 0 {
                info!(controllers = left, "Controllers left paused until start");
            }
        }
        Ok(())
    }

    async fn run_start(&mut self) -> Result<(), LifecycleError> {
        self.enter(RunState::Preflight);
        self.hypervisor.ping().await?;
        let inventory = self.resolve_inventory().await?;
        self.check_cancel()?;

        self.enter(RunState::VmsTransitioning);
        for role in [Role::Master, Role::Worker] {
            let group = inventory.group(role);
            if group.is_empty() {
                continue;
            }
            info!(role = %role, vms = group.len(), "Starting role group");
            let result = self.power.start_group(group, &self.cancel).await;
            let ok = result.is_success();
            let cancelled = result.cancelled;
            let failed: Vec<String> = result
                .failures()
                .map(|o| format!("{} ({})", o.name, o.id))
                .collect();
            self.report.record_group(result);

            if cancelled {
                return Err(LifecycleError::Cancelled);
            }
            if !ok {
                return Err(LifecycleError::PowerTransition {
                    vm: failed.join(", "),
                    target: PowerState::Running,
                    reason: format!("{role} group did not start"),
                });
            }
        }

        self.enter(RunState::AwaitingCluster);
        if self.options.dry_run {
            info!("[DRY-RUN] Would wait for the cluster API");
        } else {
            self.await_cluster().await?;
        }
        self.controllers_touched = true;

        self.enter(RunState::Restoring);
        if self.config.policy.restore_workloads_on_start {
            self.restore_workloads().await;
        }
        self.resume_all().await;

        if self.options.dry_run {
            return Ok(());
        }
        if self.checkpoint.is_settled() {
            self.checkpoint.clear()?;
        } else {
            let message = format!(
                "checkpoint kept: {} workload(s) and {} controller(s) not restored",
                self.checkpoint.pending_workloads().count(),
                self.checkpoint.controllers.pending()
            );
            self.report.warn(message);
        }
        Ok(())
    }

    async fn await_cluster(&mut self) -> Result<(), LifecycleError> {
        let policy = self.config.timing.api_ready_policy();
        let cluster = self.cluster.clone();

        let api = poll_until(policy, &self.cancel, || {
            let cluster = cluster.clone();
            async move { cluster.server_version().await.ok() }
        })
        .await;
        match api {
            WaitOutcome::Ready(version) => info!(version = %version, "Cluster API ready"),
            WaitOutcome::TimedOut => {
                return Err(LifecycleError::Discovery(format!(
                    "cluster API not reachable after {}s",
                    policy.max_wait.as_secs()
                )));
            }
            WaitOutcome::Cancelled => return Err(LifecycleError::Cancelled),
        }

        if !self.config.policy.wait_for_nodes_ready {
            return Ok(());
        }
        let nodes = poll_until(policy, &self.cancel, || {
            let cluster = cluster.clone();
            async move {
                let nodes = cluster.node_readiness().await.ok()?;
                (!nodes.is_empty() && nodes.iter().all(|n| n.ready)).then_some(nodes.len())
            }
        })
        .await;
        match nodes {
            WaitOutcome::Ready(count) => info!(nodes = count, "All nodes Ready"),
            WaitOutcome::TimedOut => {
                self.warn_unready_nodes().await;
                self.report.warn(format!(
                    "nodes not all Ready after {}s",
                    policy.max_wait.as_secs()
                ));
            }
            WaitOutcome::Cancelled => return Err(LifecycleError::Cancelled),
        }
        Ok(())
    }

    async fn restore_workloads(&mut self) {
        let pending: Vec<_> = self.checkpoint.pending_workloads().cloned().collect();
        for entry in pending {
            if self.options.dry_run {
                info!(
                    workload = %entry.workload,
                    replicas = entry.original_replicas,
                    "[DRY-RUN] Would restore replicas"
                );
                continue;
            }

            let result = self
                .cluster
                .scale_workload(&entry.workload, entry.original_replicas)
                .await;
            let error = match result {
                Ok(()) => {
                    info!(workload = %entry.workload, replicas = entry.original_replicas, "Restored replicas");
                    self.checkpoint.mark_restored(&entry.workload);
                    None
                }
                Err(e) => {
                    warn!(workload = %entry.workload, error = %e, "Failed to restore replicas");
                    self.report
                        .warn(format!("failed to restore {}: {e}", entry.workload));
                    Some(e.to_string())
                }
            };
            self.report.restored_workloads.push(RestoreOutcome {
                workload: entry.workload,
                replicas: entry.original_replicas,
                error,
            });
        }
        if let Err(e) = self.save_checkpoint() {
            self.report.warn(e.to_string());
        }
    }

    async fn run_status(&mut self) -> Result<(), LifecycleError> {
        self.enter(RunState::Preflight);
        self.hypervisor.ping().await?;
        self.resolve_inventory().await?;

        match self
            .resolver
            .resolve_volumes(&self.config.storage.storage_class)
            .await
        {
            Ok(volumes) => self.report.record_volume_status(&volumes),
            Err(e) => self.report.warn(format!("volumes unavailable: {e}")),
        }

        let pending = self.checkpoint.controllers.pending();
        self.report.controllers.left_paused = pending;
        let workloads = self.checkpoint.pending_workloads().count();
        if pending > 0 || workloads > 0 {
            self.report.warn(format!(
                "checkpoint holds {workloads} scaled workload(s) and {pending} paused controller(s)"
            ));
        }
        Ok(())
    }

    async fn run_resume(&mut self) -> Result<(), LifecycleError> {
        self.enter(RunState::Restoring);
        if self.checkpoint.controllers.pending() == 0 {
            self.report.warn("no paused controllers recorded in the checkpoint");
            return Ok(());
        }
        self.controllers_touched = true;
        self.resume_all().await;
        if self.checkpoint.is_settled() {
            self.checkpoint.clear()?;
        }
        Ok(())
    }
}
