//! Inventory resolver.
//!
//! Discovers managed VMs by tag on the hypervisor and storage-engine volumes
//! by storage class on the cluster. Every query is all-or-nothing: any
//! control-plane failure or malformed entry fails the whole query with a
//! discovery error instead of returning a partial set.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::cluster::ClusterApi;
use crate::config::HypervisorConfig;
use crate::error::LifecycleError;
use crate::hypervisor::{Hypervisor, VmRecord};
use crate::model::{ClaimRef, ManagedVm, ReleaseStatus, Role, RoleFilter, StorageVolume};

/// Tags that identify managed VMs and their roles.
#[derive(Debug, Clone)]
pub struct TagSelector {
    /// Tag every managed VM must carry, if any.
    pub cluster_tag: Option<String>,
    pub master_tag: String,
    pub worker_tag: String,
}

impl TagSelector {
    #[must_use]
    pub fn from_config(config: &HypervisorConfig) -> Self {
        Self {
            cluster_tag: config.cluster_tag.as_deref().map(str::to_lowercase),
            master_tag: config.master_tag.to_lowercase(),
            worker_tag: config.worker_tag.to_lowercase(),
        }
    }

    /// Role of a VM from its tags. `Ok(None)` means the VM is unmanaged.
    pub fn role_of(&self, record: &VmRecord) -> Result<Option<Role>, LifecycleError> {
        if let Some(ref cluster_tag) = self.cluster_tag {
            if !record.tags.iter().any(|t| t == cluster_tag) {
                return Ok(None);
            }
        }

        let master = record.tags.iter().any(|t| *t == self.master_tag);
        let worker = record.tags.iter().any(|t| *t == self.worker_tag);
        match (master, worker) {
            (true, true) => Err(LifecycleError::Discovery(format!(
                "VM {} ({}) carries both '{}' and '{}' tags",
                record.name, record.id, self.master_tag, self.worker_tag
            ))),
            (true, false) => Ok(Some(Role::Master)),
            (false, true) => Ok(Some(Role::Worker)),
            (false, false) => Ok(None),
        }
    }
}

/// VMs of one run, grouped by role and sorted by boot order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmInventory {
    pub masters: Vec<ManagedVm>,
    pub workers: Vec<ManagedVm>,
}

impl VmInventory {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.masters.is_empty() && self.workers.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.masters.len() + self.workers.len()
    }

    #[must_use]
    pub fn group(&self, role: Role) -> &[ManagedVm] {
        match role {
            Role::Master => &self.masters,
            Role::Worker => &self.workers,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManagedVm> {
        self.masters.iter().chain(self.workers.iter())
    }
}

/// Read-only discovery against both control planes.
#[derive(Clone)]
pub struct InventoryResolver {
    hypervisor: Arc<dyn Hypervisor>,
    cluster: Arc<dyn ClusterApi>,
    selector: TagSelector,
}

impl InventoryResolver {
    #[must_use]
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        cluster: Arc<dyn ClusterApi>,
        selector: TagSelector,
    ) -> Self {
        Self {
            hypervisor,
            cluster,
            selector,
        }
    }

    /// Managed VMs admitted by `filter`, grouped by role and sorted by boot order.
    pub async fn resolve_vms(&self, filter: RoleFilter) -> Result<VmInventory, LifecycleError> {
        let records = self
            .hypervisor
            .list_vms(self.selector.cluster_tag.as_deref())
            .await?;

        let mut seen = HashSet::new();
        let mut inventory = VmInventory::default();

        for record in records {
            if !seen.insert(record.id) {
                return Err(LifecycleError::Discovery(format!(
                    "VM id {} listed more than once",
                    record.id
                )));
            }
            let Some(role) = self.selector.role_of(&record)? else {
                continue;
            };
            if !filter.includes(role) {
                continue;
            }

            let boot_order = self.hypervisor.boot_order(&record).await?;
            let vm = ManagedVm {
                id: record.id,
                name: record.name,
                node: record.node,
                role,
                boot_order,
                power: record.power,
            };
            match role {
                Role::Master => inventory.masters.push(vm),
                Role::Worker => inventory.workers.push(vm),
            }
        }

        inventory.masters.sort_by_key(ManagedVm::boot_key);
        inventory.workers.sort_by_key(ManagedVm::boot_key);

        info!(
            masters = inventory.masters.len(),
            workers = inventory.workers.len(),
            "Resolved VM inventory"
        );
        Ok(inventory)
    }

    /// Volumes whose storage class is `storage_class`, with their release status.
    pub async fn resolve_volumes(
        &self,
        storage_class: &str,
    ) -> Result<Vec<StorageVolume>, LifecycleError> {
        let volumes = self.cluster.list_persistent_volumes().await?;
        let pods = self.cluster.list_pods(None).await?;

        let mut resolved = Vec::new();
        for pv in volumes {
            if pv.storage_class.as_deref() != Some(storage_class) {
                continue;
            }

            let claim = pv.claim.map(|(namespace, name)| ClaimRef { namespace, name });
            let status = match (&claim, pv.phase.as_str()) {
                (Some(claim), "Bound") => {
                    let in_use = pods.iter().any(|p| {
                        p.namespace == claim.namespace
                            && p.phase.is_active()
                            && p.references_claim(&claim.name)
                    });
                    if in_use {
                        ReleaseStatus::BoundInUse
                    } else {
                        ReleaseStatus::BoundUnused
                    }
                }
                (None, "Bound") => {
                    return Err(LifecycleError::Discovery(format!(
                        "PersistentVolume {} is Bound without a claimRef",
                        pv.name
                    )));
                }
                _ => ReleaseStatus::Available,
            };

            debug!(volume = %pv.name, status = ?status, "Discovered volume");
            resolved.push(StorageVolume {
                name: pv.name,
                storage_class: storage_class.to_string(),
                claim,
                status,
            });
        }

        resolved.sort_by(|a, b| a.name.cmp(&b.name));
        info!(storage_class, count = resolved.len(), "Resolved storage volumes");
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PowerState;

    fn selector(cluster_tag: Option<&str>) -> TagSelector {
        TagSelector {
            cluster_tag: cluster_tag.map(ToString::to_string),
            master_tag: "master".into(),
            worker_tag: "worker".into(),
        }
    }

    fn record(tags: &[&str]) -> VmRecord {
        VmRecord {
            id: 100,
            name: "vm".into(),
            node: "pve".into(),
            tags: tags.iter().map(ToString::to_string).collect(),
            power: PowerState::Running,
        }
    }

    #[test]
    fn test_role_from_tags() {
        let s = selector(None);
        assert_eq!(s.role_of(&record(&["master"])).unwrap(), Some(Role::Master));
        assert_eq!(s.role_of(&record(&["k8s", "worker"])).unwrap(), Some(Role::Worker));
        assert_eq!(s.role_of(&record(&["dns"])).unwrap(), None);
    }

    #[test]
    fn test_conflicting_roles_rejected() {
        let err = selector(None)
            .role_of(&record(&["master", "worker"]))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Discovery(_)));
    }

    #[test]
    fn test_cluster_tag_required_when_set() {
        let s = selector(Some("k8s"));
        assert_eq!(s.role_of(&record(&["master"])).unwrap(), None);
        assert_eq!(s.role_of(&record(&["k8s", "master"])).unwrap(), Some(Role::Master));
    }
}
