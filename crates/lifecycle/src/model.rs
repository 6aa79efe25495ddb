//! Core data model shared by the inventory, drainer and power sequencer.
//!
//! Nothing here is persisted except through [`crate::state::RunCheckpoint`];
//! every run rebuilds these values from the two control planes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Role of a managed virtual machine in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Control-plane node.
    Master,
    /// Worker node.
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Which role groups a run targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RoleFilter {
    /// Both masters and workers.
    #[default]
    All,
    /// Masters only.
    Master,
    /// Workers only.
    Worker,
}

impl RoleFilter {
    /// Whether the filter admits `role`.
    #[must_use]
    pub fn includes(self, role: Role) -> bool {
        match self {
            Self::All => true,
            Self::Master => role == Role::Master,
            Self::Worker => role == Role::Worker,
        }
    }
}

/// Power state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Stopped,
    #[serde(other)]
    Unknown,
}

impl PowerState {
    /// Map a hypervisor status string.
    #[must_use]
    pub fn parse(status: &str) -> Self {
        match status {
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A virtual machine that hosts a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedVm {
    /// Numeric VM id.
    pub id: u32,
    /// Display name.
    pub name: String,
    /// Hypervisor host currently running the VM.
    pub node: String,
    /// Role derived from the VM's tags.
    pub role: Role,
    /// Declared boot order; `None` sorts after every explicit order.
    pub boot_order: Option<u32>,
    /// Power state at discovery time.
    pub power: PowerState,
}

impl ManagedVm {
    /// Sort key giving a total order within a role group.
    #[must_use]
    pub fn boot_key(&self) -> (u32, u32) {
        (self.boot_order.unwrap_or(u32::MAX), self.id)
    }
}

impl fmt::Display for ManagedVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Reference to the claim a persistent volume is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimRef {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ClaimRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Release status of a storage volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    /// Bound and referenced by at least one active pod.
    BoundInUse,
    /// Bound but no active pod references the claim.
    BoundUnused,
    /// Not bound to any claim.
    Available,
}

/// A persistent volume backed by the distributed storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageVolume {
    /// Persistent volume name.
    pub name: String,
    pub storage_class: String,
    pub claim: Option<ClaimRef>,
    pub status: ReleaseStatus,
}

/// Kind of a scalable (or explicitly excluded) workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    ReplicaSet,
    /// Never scaled; listed so exclusion is explicit.
    DaemonSet,
}

impl WorkloadKind {
    /// Daemon-sets cannot be scaled to zero.
    #[must_use]
    pub fn is_scalable(self) -> bool {
        !matches!(self, Self::DaemonSet)
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
            Self::ReplicaSet => "ReplicaSet",
            Self::DaemonSet => "DaemonSet",
        };
        f.write_str(s)
    }
}

/// Identity of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A workload and the claims its pods reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub reference: WorkloadRef,
    /// Desired replica count (`spec.replicas`).
    pub replicas: i32,
    /// Claim names mounted directly by the pod template.
    pub template_claims: Vec<String>,
    /// Volume claim template names (stateful-sets only).
    pub claim_templates: Vec<String>,
}

impl Workload {
    /// Whether this workload's pods use the claim named `claim`.
    ///
    /// Stateful-set claims generated from a template are named
    /// `<template>-<statefulset>-<ordinal>`.
    #[must_use]
    pub fn uses_claim(&self, claim: &str) -> bool {
        if self.template_claims.iter().any(|c| c == claim) {
            return true;
        }
        if self.reference.kind != WorkloadKind::StatefulSet {
            return false;
        }
        self.claim_templates.iter().any(|template| {
            let prefix = format!("{template}-{}-", self.reference.name);
            claim
                .strip_prefix(&prefix)
                .is_some_and(|ordinal| !ordinal.is_empty() && ordinal.parse::<u32>().is_ok())
        })
    }
}

/// Pod lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    #[must_use]
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// Pending pods are about to mount their volumes, so they count as active.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// The subset of a pod the orchestrator cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub phase: PodPhase,
    /// Top-level owning workload, if any.
    pub owner: Option<WorkloadRef>,
    /// Claim names from the pod's volumes.
    pub claims: Vec<String>,
}

impl PodInfo {
    #[must_use]
    pub fn references_claim(&self, claim: &str) -> bool {
        self.claims.iter().any(|c| c == claim)
    }
}

/// Node readiness as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReadiness {
    pub name: String,
    pub ready: bool,
}
