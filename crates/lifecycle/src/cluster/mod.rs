//! Kubernetes control plane abstraction.
//!
//! [`ClusterApi`] is the read/scale surface the inventory resolver, drainer and
//! orchestrator share. [`KubeCluster`] implements it with kube-rs; tests use
//! in-memory fakes.

mod client;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{NodeReadiness, PodInfo, Workload, WorkloadRef};

pub use client::KubeCluster;

/// Errors that can occur talking to the cluster.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Object is missing a field the orchestrator relies on.
    #[error("Malformed {kind} {name}: {reason}")]
    Malformed {
        kind: String,
        name: String,
        reason: String,
    },

    /// Client configuration failed.
    #[error("Cluster configuration error: {0}")]
    Config(String),
}

/// A persistent volume as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentVolumeInfo {
    pub name: String,
    pub storage_class: Option<String>,
    /// `(namespace, name)` of the bound claim.
    pub claim: Option<(String, String)>,
    /// `status.phase`, e.g. `Bound` or `Available`.
    pub phase: String,
}

/// A verb on a resource type the current identity must be allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessCheck {
    pub verb: &'static str,
    /// API group; empty for the core group.
    pub group: &'static str,
    pub resource: &'static str,
}

impl AccessCheck {
    const fn new(verb: &'static str, group: &'static str, resource: &'static str) -> Self {
        Self {
            verb,
            group,
            resource,
        }
    }
}

impl std::fmt::Display for AccessCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{} {}", self.verb, self.resource)
        } else {
            write!(f, "{} {}.{}", self.verb, self.resource, self.group)
        }
    }
}

/// Access a shutdown needs before it mutates anything.
pub const SHUTDOWN_ACCESS: &[AccessCheck] = &[
    AccessCheck::new("list", "", "persistentvolumes"),
    AccessCheck::new("list", "", "pods"),
    AccessCheck::new("list", "", "nodes"),
    AccessCheck::new("list", "apps", "deployments"),
    AccessCheck::new("patch", "apps", "deployments"),
    AccessCheck::new("list", "apps", "statefulsets"),
    AccessCheck::new("patch", "apps", "statefulsets"),
    AccessCheck::new("list", "apps", "replicasets"),
    AccessCheck::new("patch", "apps", "replicasets"),
];

/// Capabilities the orchestrator needs from the cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// API server version string; doubles as a connectivity check.
    async fn server_version(&self) -> Result<String, ClusterError>;

    /// Ready condition of every node.
    async fn node_readiness(&self) -> Result<Vec<NodeReadiness>, ClusterError>;

    /// Every persistent volume in the cluster.
    async fn list_persistent_volumes(&self) -> Result<Vec<PersistentVolumeInfo>, ClusterError>;

    /// Deployments, stateful-sets, standalone replica-sets and daemon-sets in `namespace`.
    async fn list_workloads(&self, namespace: &str) -> Result<Vec<Workload>, ClusterError>;

    /// Pods in `namespace`, or in every namespace when `None`.
    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<PodInfo>, ClusterError>;

    /// Set `spec.replicas` of a workload.
    async fn scale_workload(&self, workload: &WorkloadRef, replicas: i32)
        -> Result<(), ClusterError>;

    /// Attachment state the storage engine reports for `volume`, if it tracks it.
    async fn storage_engine_state(&self, volume: &str) -> Result<Option<String>, ClusterError>;

    /// Whether the current identity may perform `check` cluster-wide.
    async fn can_i(&self, check: &AccessCheck) -> Result<bool, ClusterError>;
}
