//! Orchestrator configuration.
//!
//! Layered as defaults, then an optional TOML file, then command-line flags
//! (which also read environment variables through clap).

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::LifecycleError;
use crate::wait::PollPolicy;

/// Full orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub hypervisor: HypervisorConfig,
    pub cluster: ClusterConfig,
    pub storage: StorageConfig,
    pub controllers: ControllersConfig,
    pub timing: TimingConfig,
    pub policy: PolicyConfig,
    pub checkpoint: CheckpointConfig,
}

/// Proxmox endpoint and tag conventions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// API base URL, e.g. `https://pve.lan:8006`.
    pub url: String,
    /// API token id, e.g. `root@pam!lifecycle`.
    pub token_id: String,
    /// API token secret. Never written back out.
    #[serde(skip_serializing)]
    pub token_secret: String,
    /// Accept self-signed certificates.
    pub insecure_tls: bool,
    /// Tag every managed VM carries.
    pub cluster_tag: Option<String>,
    pub master_tag: String,
    pub worker_tag: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token_id: String::new(),
            token_secret: String::new(),
            insecure_tls: false,
            cluster_tag: None,
            master_tag: "master".to_string(),
            worker_tag: "worker".to_string(),
        }
    }
}

/// Kubernetes connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Kubeconfig path; default loading rules apply when unset.
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context.
    pub context: Option<String>,
}

/// Storage engine scope and namespace policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage class served by the distributed storage engine.
    pub storage_class: String,
    /// Namespace holding the engine's volume objects.
    pub engine_namespace: String,
    /// Infrastructure namespace where only ingress workloads may be drained.
    pub infra_namespace: String,
    /// Name pattern of the ingress workloads allowed in `infra_namespace`.
    pub ingress_pattern: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_class: "longhorn".to_string(),
            engine_namespace: "longhorn-system".to_string(),
            infra_namespace: "kube-system".to_string(),
            ingress_pattern: "^(traefik|ingress-nginx|nginx-ingress)".to_string(),
        }
    }
}

/// Reconciling controllers to pause.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllersConfig {
    /// Pause ArgoCD applications.
    pub argocd: bool,
    /// Namespace of ArgoCD applications; all namespaces when unset.
    pub argocd_namespace: Option<String>,
    /// Operator-managed custom resources.
    pub operators: Vec<OperatorControllerConfig>,
}

impl Default for ControllersConfig {
    fn default() -> Self {
        Self {
            argocd: true,
            argocd_namespace: None,
            operators: Vec::new(),
        }
    }
}

/// How an operator custom resource is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseMode {
    /// Integer field set to 0 while paused.
    Replicas,
    /// Boolean field set to `true` while paused.
    Flag,
}

/// One operator custom resource kind to pause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorControllerConfig {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    /// Restrict to one namespace.
    #[serde(default)]
    pub namespace: Option<String>,
    /// JSON pointer to the pause field, e.g. `/spec/replicas`.
    pub pointer: String,
    pub mode: PauseMode,
}

/// Poll intervals and wait budgets, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_secs: u64,
    /// Budget for a drained workload's pods to terminate.
    pub drain_max_wait_secs: u64,
    /// Graceful shutdown timeout passed to the hypervisor.
    pub shutdown_timeout_secs: u64,
    /// Budget for a role group to reach its power state; scaled to group size when unset.
    pub power_max_wait_secs: Option<u64>,
    /// Budget for the cluster API to become ready after start.
    pub api_ready_max_wait_secs: u64,
    /// Cluster API calls the drainer keeps in flight at once.
    pub drain_parallelism: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            drain_max_wait_secs: 300,
            shutdown_timeout_secs: 180,
            power_max_wait_secs: None,
            api_ready_max_wait_secs: 900,
            drain_parallelism: 5,
        }
    }
}

/// Base power budget before scaling by group size.
const POWER_BASE_WAIT_SECS: u64 = 600;
/// Extra power budget per VM in a group.
const POWER_PER_VM_WAIT_SECS: u64 = 60;

impl TimingConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub fn drain_policy(&self) -> PollPolicy {
        PollPolicy::new(
            self.poll_interval(),
            Duration::from_secs(self.drain_max_wait_secs),
        )
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Power wait policy for a group of `group_size` VMs.
    #[must_use]
    pub fn power_policy(&self, group_size: usize) -> PollPolicy {
        let secs = self.power_max_wait_secs.unwrap_or_else(|| {
            POWER_BASE_WAIT_SECS + POWER_PER_VM_WAIT_SECS * group_size as u64
        });
        PollPolicy::new(self.poll_interval(), Duration::from_secs(secs))
    }

    #[must_use]
    pub fn api_ready_policy(&self) -> PollPolicy {
        PollPolicy::new(
            self.poll_interval(),
            Duration::from_secs(self.api_ready_max_wait_secs),
        )
    }
}

/// Run policy switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Resume controllers after a successful shutdown. Off by default so GitOps
    /// does not fight a stopped cluster.
    pub resume_controllers_after_shutdown: bool,
    /// Scale checkpointed workloads back to their original replicas on start.
    pub restore_workloads_on_start: bool,
    /// Require every node Ready before the cluster counts as started.
    pub wait_for_nodes_ready: bool,
    /// Check API permissions with access reviews before shutdown mutates anything.
    pub verify_access: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            resume_controllers_after_shutdown: false,
            restore_workloads_on_start: true,
            wait_for_nodes_ready: true,
            verify_access: true,
        }
    }
}

/// Checkpoint persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub enabled: bool,
    /// Directory for `checkpoint.json`; `~/.cluster-lifecycle` when unset.
    pub state_dir: Option<PathBuf>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            state_dir: None,
        }
    }
}

impl CheckpointConfig {
    /// Resolved checkpoint directory.
    #[must_use]
    pub fn dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".cluster-lifecycle"))
                .unwrap_or_else(|| PathBuf::from(".cluster-lifecycle"))
        })
    }
}

impl LifecycleConfig {
    /// Load from a TOML file, or defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, LifecycleError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|e| {
            LifecycleError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parse TOML content.
    pub fn from_toml(content: &str) -> Result<Self, LifecycleError> {
        toml::from_str(content).map_err(|e| LifecycleError::Config(e.to_string()))
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        let t = &self.timing;
        if t.poll_interval_secs == 0 {
            return Err(LifecycleError::Config("poll interval must be positive".into()));
        }
        if t.drain_max_wait_secs < t.poll_interval_secs
            || t.api_ready_max_wait_secs < t.poll_interval_secs
            || t.power_max_wait_secs.is_some_and(|w| w < t.poll_interval_secs)
        {
            return Err(LifecycleError::Config(
                "max-wait budgets must be at least one poll interval".into(),
            ));
        }
        if t.drain_parallelism == 0 {
            return Err(LifecycleError::Config("drain parallelism must be positive".into()));
        }
        if self.hypervisor.master_tag.eq_ignore_ascii_case(&self.hypervisor.worker_tag) {
            return Err(LifecycleError::Config(
                "master and worker tags must differ".into(),
            ));
        }
        Regex::new(&self.storage.ingress_pattern)
            .map_err(|e| LifecycleError::Config(format!("invalid ingress pattern: {e}")))?;
        for op in &self.controllers.operators {
            if !op.pointer.starts_with('/') {
                return Err(LifecycleError::Config(format!(
                    "operator {} pointer '{}' must start with '/'",
                    op.kind, op.pointer
                )));
            }
        }
        Ok(())
    }
}
