//! Proxmox VE API client implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use super::models::{ApiResponse, ClusterResource, ShutdownBody, VmConfig, VmStatus};
use crate::hypervisor::{Hypervisor, HypervisorError, VmRecord};
use crate::model::{ManagedVm, PowerState};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Proxmox VE hypervisor reached through an API token.
#[derive(Clone)]
pub struct Proxmox {
    /// HTTP client.
    client: Client,
    /// Base URL, e.g. `https://pve.example:8006`.
    base_url: String,
    /// Full token id, e.g. `root@pam!lifecycle`.
    token_id: String,
    /// Token secret.
    token_secret: String,
}

impl Proxmox {
    /// Create a new Proxmox client.
    ///
    /// # Errors
    /// Returns error if the URL is empty or the HTTP client cannot be created.
    pub fn new(
        base_url: impl Into<String>,
        token_id: impl Into<String>,
        token_secret: impl Into<String>,
        insecure_tls: bool,
    ) -> Result<Self, HypervisorError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(HypervisorError::Config("Proxmox URL is empty".into()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .danger_accept_invalid_certs(insecure_tls)
            .build()?;

        Ok(Self {
            client,
            base_url,
            token_id: token_id.into(),
            token_secret: token_secret.into(),
        })
    }

    fn auth_header(&self) -> String {
        format!("PVEAPIToken={}={}", self.token_id, self.token_secret)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api2/json{path}", self.base_url)
    }

    /// Make an authenticated GET request.
    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, HypervisorError> {
        let url = self.url(path);
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .query(query)
            .send()
            .await?;

        let body: ApiResponse<T> = Self::handle_response(response).await?;
        Ok(body.data)
    }

    /// Make an authenticated form POST whose response payload is ignored
    /// (Proxmox answers power actions with a task UPID).
    async fn post_form<B: serde::Serialize>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<(), HypervisorError> {
        let url = self.url(path);
        debug!(url = %url, "POST request");

        let mut request = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header());
        if let Some(body) = body {
            request = request.form(body);
        }

        let response = request.send().await?;
        let _: ApiResponse<serde_json::Value> = Self::handle_response(response).await?;
        Ok(())
    }

    /// Handle API response, parsing JSON or error.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, HypervisorError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                HypervisorError::Malformed(e.to_string())
            })
        } else if status == StatusCode::NOT_FOUND {
            Err(HypervisorError::NotFound(text))
        } else {
            Err(HypervisorError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    fn vm_path(vm: &ManagedVm, suffix: &str) -> String {
        format!("/nodes/{}/qemu/{}{suffix}", vm.node, vm.id)
    }
}

#[async_trait]
impl Hypervisor for Proxmox {
    async fn ping(&self) -> Result<(), HypervisorError> {
        let _: serde_json::Value = self.get("/version", &[]).await?;
        Ok(())
    }

    async fn list_vms(&self, tag: Option<&str>) -> Result<Vec<VmRecord>, HypervisorError> {
        let resources: Vec<ClusterResource> =
            self.get("/cluster/resources", &[("type", "vm")]).await?;

        let wanted = tag.map(str::to_lowercase);
        let mut records = Vec::new();

        for resource in resources {
            if resource.is_template() || resource.resource_type.as_deref() == Some("lxc") {
                continue;
            }
            let tags = resource.tag_list();
            if let Some(ref wanted) = wanted {
                if !tags.iter().any(|t| t == wanted) {
                    continue;
                }
            }

            records.push(VmRecord {
                id: resource.vmid,
                name: resource
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("vm-{}", resource.vmid)),
                node: resource.node.clone(),
                power: PowerState::parse(resource.status.as_deref().unwrap_or("unknown")),
                tags,
            });
        }

        debug!(count = records.len(), tag = ?tag, "Listed VMs");
        Ok(records)
    }

    async fn boot_order(&self, vm: &VmRecord) -> Result<Option<u32>, HypervisorError> {
        let config: VmConfig = self
            .get(&format!("/nodes/{}/qemu/{}/config", vm.node, vm.id), &[])
            .await?;
        Ok(config.boot_order())
    }

    async fn power_state(&self, vm: &ManagedVm) -> Result<PowerState, HypervisorError> {
        let status: VmStatus = self.get(&Self::vm_path(vm, "/status/current"), &[]).await?;
        Ok(PowerState::parse(&status.status))
    }

    async fn request_shutdown(
        &self,
        vm: &ManagedVm,
        timeout: Duration,
    ) -> Result<(), HypervisorError> {
        info!(vm_id = vm.id, node = %vm.node, timeout_secs = timeout.as_secs(), "Requesting shutdown");
        let body = ShutdownBody {
            timeout: timeout.as_secs(),
            force_stop: 0,
        };
        self.post_form(&Self::vm_path(vm, "/status/shutdown"), Some(&body))
            .await
    }

    async fn request_start(&self, vm: &ManagedVm) -> Result<(), HypervisorError> {
        info!(vm_id = vm.id, node = %vm.node, "Requesting start");
        self.post_form::<()>(&Self::vm_path(vm, "/status/start"), None)
            .await
    }
}
