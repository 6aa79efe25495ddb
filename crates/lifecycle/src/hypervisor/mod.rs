//! Hypervisor control plane abstraction.
//!
//! The orchestrator only needs a handful of capabilities from the hypervisor:
//! list tagged VMs, read a managed VM's boot order and power state, request a
//! graceful shutdown, and request power-on. Retries belong to the hypervisor client; the orchestrator
//! relies on its own poll loops.

pub mod proxmox;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{ManagedVm, PowerState};

pub use proxmox::Proxmox;

/// Errors that can occur talking to the hypervisor.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// VM not found.
    #[error("VM not found: {0}")]
    NotFound(String),

    /// Response could not be parsed.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// A VM as listed by the hypervisor, before role resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRecord {
    pub id: u32,
    pub name: String,
    pub node: String,
    pub tags: Vec<String>,
    pub power: PowerState,
}

/// Capabilities the orchestrator needs from a hypervisor.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Check the API is reachable and authenticated.
    async fn ping(&self) -> Result<(), HypervisorError>;

    /// List every VM carrying `tag`, or every VM when `tag` is `None`.
    async fn list_vms(&self, tag: Option<&str>) -> Result<Vec<VmRecord>, HypervisorError>;

    /// Declared boot order of a VM, if it has one. Only asked for managed VMs.
    async fn boot_order(&self, vm: &VmRecord) -> Result<Option<u32>, HypervisorError>;

    /// Current power state of a VM.
    async fn power_state(&self, vm: &ManagedVm) -> Result<PowerState, HypervisorError>;

    /// Request a guest-cooperative shutdown, bounded by `timeout` on the hypervisor side.
    async fn request_shutdown(&self, vm: &ManagedVm, timeout: Duration)
        -> Result<(), HypervisorError>;

    /// Request power-on.
    async fn request_start(&self, vm: &ManagedVm) -> Result<(), HypervisorError>;
}
