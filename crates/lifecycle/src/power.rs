//! VM power sequencer.
//!
//! Operates on one role group at a time. Requests inside a group are issued
//! concurrently and the sequencer then waits for every member to reach the
//! target state. Group ordering (workers before masters on shutdown, masters
//! before workers on start) is the orchestrator's job.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TimingConfig;
use crate::error::LifecycleError;
use crate::hypervisor::Hypervisor;
use crate::model::{ManagedVm, PowerState, Role};
use crate::wait::{poll_until, PollPolicy, WaitOutcome};

/// What the sequencer did for one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    /// Already in the target state; nothing requested.
    AlreadyThere,
    Requested,
    WouldRequest,
    /// The request itself was rejected.
    RequestFailed,
}

/// Per-VM result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmOutcome {
    pub id: u32,
    pub name: String,
    pub role: Role,
    pub target: PowerState,
    pub action: PowerAction,
    /// Whether the VM was observed in the target state.
    pub reached: bool,
    pub error: Option<String>,
}

impl VmOutcome {
    fn new(vm: &ManagedVm, target: PowerState, action: PowerAction) -> Self {
        Self {
            id: vm.id,
            name: vm.name.clone(),
            role: vm.role,
            target,
            action,
            reached: false,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Result of transitioning one role group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupResult {
    pub outcomes: Vec<VmOutcome>,
    pub cancelled: bool,
}

impl GroupResult {
    pub fn failures(&self) -> impl Iterator<Item = &VmOutcome> {
        self.outcomes.iter().filter(|o| o.failed())
    }

    /// Every VM reached the target and the wait was not cancelled.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failures().next().is_none()
    }
}

/// Issues power transitions for one role group at a time.
#[derive(Clone)]
pub struct PowerSequencer {
    hypervisor: Arc<dyn Hypervisor>,
    timing: TimingConfig,
    dry_run: bool,
}

impl PowerSequencer {
    #[must_use]
    pub fn new(hypervisor: Arc<dyn Hypervisor>, timing: TimingConfig, dry_run: bool) -> Self {
        Self {
            hypervisor,
            timing,
            dry_run,
        }
    }

    /// Gracefully shut down `vms` and wait until all are stopped.
    ///
    /// A VM still running at the deadline is escalated: logged and reported
    /// as failed. It is never force-stopped.
    pub async fn shutdown_group(&self, vms: &[ManagedVm], cancel: &CancellationToken) -> GroupResult {
        self.transition(vms, PowerState::Stopped, cancel).await
    }

    /// Power on `vms` and wait until all are running.
    pub async fn start_group(&self, vms: &[ManagedVm], cancel: &CancellationToken) -> GroupResult {
        self.transition(vms, PowerState::Running, cancel).await
    }

    async fn transition(
        &self,
        vms: &[ManagedVm],
        target: PowerState,
        cancel: &CancellationToken,
    ) -> GroupResult {
        if vms.is_empty() {
            return GroupResult::default();
        }
        let policy = self.timing.power_policy(vms.len());
        info!(
            vms = vms.len(),
            target = %target,
            max_wait_secs = policy.max_wait.as_secs(),
            "Transitioning role group"
        );

        let requested: Vec<VmOutcome> =
            join_all(vms.iter().map(|vm| self.request(vm, target))).await;

        let mut result = GroupResult {
            outcomes: join_all(
                vms.iter()
                    .zip(requested)
                    .map(|(vm, outcome)| self.await_target(vm, outcome, policy, cancel)),
            )
            .await,
            cancelled: false,
        };
        result.cancelled = cancel.is_cancelled();
        result
    }

    async fn current_state(&self, vm: &ManagedVm) -> PowerState {
        match self.hypervisor.power_state(vm).await {
            Ok(state) => state,
            Err(e) => {
                debug!(vm_id = vm.id, error = %e, "Power state unavailable, using discovered state");
                vm.power
            }
        }
    }

    async fn request(&self, vm: &ManagedVm, target: PowerState) -> VmOutcome {
        if self.current_state(vm).await == target {
            info!(vm = %vm, state = %target, "Already in target state");
            let mut outcome = VmOutcome::new(vm, target, PowerAction::AlreadyThere);
            outcome.reached = true;
            return outcome;
        }

        if self.dry_run {
            info!(vm = %vm, target = %target, "[DRY-RUN] Would request power transition");
            return VmOutcome::new(vm, target, PowerAction::WouldRequest);
        }

        let sent = match target {
            PowerState::Stopped => {
                self.hypervisor
                    .request_shutdown(vm, self.timing.shutdown_timeout())
                    .await
            }
            _ => self.hypervisor.request_start(vm).await,
        };

        match sent {
            Ok(()) => {
                info!(vm = %vm, node = %vm.node, target = %target, "Power transition requested");
                VmOutcome::new(vm, target, PowerAction::Requested)
            }
            Err(e) => {
                let err = LifecycleError::power(vm, target, format!("request rejected: {e}"));
                error!("{err}");
                let mut outcome = VmOutcome::new(vm, target, PowerAction::RequestFailed);
                outcome.error = Some(err.to_string());
                outcome
            }
        }
    }

    async fn await_target(
        &self,
        vm: &ManagedVm,
        mut outcome: VmOutcome,
        policy: PollPolicy,
        cancel: &CancellationToken,
    ) -> VmOutcome {
        if outcome.action != PowerAction::Requested {
            return outcome;
        }
        let target = outcome.target;

        let wait = poll_until(policy, cancel, || async move {
            match self.hypervisor.power_state(vm).await {
                Ok(state) if state == target => Some(()),
                Ok(state) => {
                    debug!(vm_id = vm.id, state = %state, target = %target, "Waiting for power state");
                    None
                }
                Err(e) => {
                    debug!(vm_id = vm.id, error = %e, "Power state query failed, retrying");
                    None
                }
            }
        })
        .await;

        match wait {
            WaitOutcome::Ready(()) => {
                info!(vm = %vm, state = %target, "Reached target state");
                outcome.reached = true;
            }
            WaitOutcome::TimedOut => {
                let err = LifecycleError::power(vm, target, timeout_reason(target, policy.max_wait));
                warn!("{err}");
                outcome.error = Some(err.to_string());
            }
            WaitOutcome::Cancelled => {
                outcome.error = Some(
                    LifecycleError::power(vm, target, "wait cancelled").to_string(),
                );
            }
        }
        outcome
    }
}

fn timeout_reason(target: PowerState, waited: Duration) -> String {
    match target {
        PowerState::Stopped => format!(
            "still running after {}s; escalating to the operator, no hard stop issued",
            waited.as_secs()
        ),
        _ => format!("not running after {}s", waited.as_secs()),
    }
}
