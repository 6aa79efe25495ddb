//! Proxmox VE API request/response models.

use serde::{Deserialize, Serialize};

/// Every Proxmox response wraps its payload in `data`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

/// Entry from `GET /cluster/resources?type=vm`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterResource {
    pub vmid: u32,
    pub node: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Semicolon separated tag list.
    #[serde(default)]
    pub tags: Option<String>,
    /// `qemu` or `lxc`.
    #[serde(rename = "type", default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub template: Option<u8>,
}

impl ClusterResource {
    /// Tags as a list. Proxmox accepts `;`, `,` and spaces as separators.
    #[must_use]
    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .as_deref()
            .unwrap_or_default()
            .split([';', ',', ' '])
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect()
    }

    #[must_use]
    pub fn is_template(&self) -> bool {
        self.template == Some(1)
    }
}

/// Subset of `GET /nodes/{node}/qemu/{vmid}/config`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VmConfig {
    /// Startup and shutdown behaviour, e.g. `order=2,up=30,down=60`.
    #[serde(default)]
    pub startup: Option<String>,
}

impl VmConfig {
    /// The `order=` component of the startup property.
    #[must_use]
    pub fn boot_order(&self) -> Option<u32> {
        self.startup
            .as_deref()?
            .split(',')
            .filter_map(|part| part.split_once('='))
            .find(|(key, _)| key.trim() == "order")
            .and_then(|(_, value)| value.trim().parse().ok())
    }
}

/// Payload of `GET /nodes/{node}/qemu/{vmid}/status/current`.
#[derive(Debug, Clone, Deserialize)]
pub struct VmStatus {
    pub status: String,
}

/// Form body for `POST .../status/shutdown`.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownBody {
    /// Seconds Proxmox waits for the guest before giving up.
    pub timeout: u64,
    /// Never escalate to a hard stop on the hypervisor side.
    #[serde(rename = "forceStop")]
    pub force_stop: u8,
}
