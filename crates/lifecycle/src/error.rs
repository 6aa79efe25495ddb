//! Error taxonomy for the lifecycle orchestrator.
//!
//! Component-level errors are accumulated into the run report; only the
//! orchestrator decides whether one changes the outcome of a run.

use std::time::Duration;

use thiserror::Error;

use crate::model::{ManagedVm, PowerState};

pub use crate::cluster::ClusterError;
pub use crate::hypervisor::HypervisorError;

/// Errors surfaced by the orchestrator and its components.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// A control plane is unreachable or returned malformed inventory.
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// One controller could not be paused.
    #[error("Failed to pause {controller}: {message}")]
    Pause { controller: String, message: String },

    /// Pods did not terminate, or a volume stayed in use, within the wait budget.
    #[error("{subject} still active after {}s", waited.as_secs())]
    DrainTimeout { subject: String, waited: Duration },

    /// A VM did not reach the requested power state.
    #[error("VM {vm} did not reach {target}: {reason}")]
    PowerTransition {
        vm: String,
        target: PowerState,
        reason: String,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The checkpoint file could not be read or written.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// The run was interrupted by the operator.
    #[error("Run cancelled")]
    Cancelled,

    /// A run step panicked.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LifecycleError {
    pub(crate) fn power(vm: &ManagedVm, target: PowerState, reason: impl Into<String>) -> Self {
        Self::PowerTransition {
            vm: vm.to_string(),
            target,
            reason: reason.into(),
        }
    }
}

impl From<HypervisorError> for LifecycleError {
    fn from(err: HypervisorError) -> Self {
        Self::Discovery(format!("hypervisor: {err}"))
    }
}

impl From<ClusterError> for LifecycleError {
    fn from(err: ClusterError) -> Self {
        Self::Discovery(format!("cluster: {err}"))
    }
}
