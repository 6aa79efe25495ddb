//! ArgoCD applications.
//!
//! An application reconciles while `spec.syncPolicy.automated` is set. Pausing
//! clears it; restoring writes the saved policy back verbatim, so an
//! application that was manual before the run stays manual.

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;
use tracing::{debug, info};

use super::{merge_patch_at, ControllerId, ControllerKind, ControllerState, ReconcilingController};
use crate::cluster::ClusterError;

const AUTOMATED_POINTER: &str = "/spec/syncPolicy/automated";

/// ArgoCD Application API resource definition.
fn argocd_application_api() -> ApiResource {
    ApiResource {
        group: "argoproj.io".to_string(),
        version: "v1alpha1".to_string(),
        api_version: "argoproj.io/v1alpha1".to_string(),
        kind: "Application".to_string(),
        plural: "applications".to_string(),
    }
}

/// Every ArgoCD application, optionally limited to one namespace.
pub struct ArgoApplications {
    client: Client,
    namespace: Option<String>,
}

impl ArgoApplications {
    #[must_use]
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn api_for(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = argocd_application_api();
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }

    fn namespaced(&self, id: &ControllerId) -> Result<Api<DynamicObject>, ClusterError> {
        let ns = id.namespace.as_deref().ok_or_else(|| ClusterError::Malformed {
            kind: "Application".into(),
            name: id.name.clone(),
            reason: "missing namespace".into(),
        })?;
        Ok(self.api_for(Some(ns)))
    }

    async fn patch_automated(&self, id: &ControllerId, value: Value) -> Result<(), ClusterError> {
        let patch = Patch::Merge(merge_patch_at(AUTOMATED_POINTER, value));
        self.namespaced(id)?
            .patch(&id.name, &PatchParams::default(), &patch)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ReconcilingController for ArgoApplications {
    fn kind(&self) -> ControllerKind {
        ControllerKind::GitOpsApp
    }

    async fn enumerate(&self) -> Result<Vec<ControllerId>, ClusterError> {
        let list = match self
            .api_for(self.namespace.as_deref())
            .list(&ListParams::default())
            .await
        {
            Ok(list) => list,
            // ArgoCD not installed.
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!("ArgoCD Application CRD not found");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        Ok(list
            .items
            .into_iter()
            .filter_map(|app| {
                Some(ControllerId {
                    kind: ControllerKind::GitOpsApp,
                    namespace: app.metadata.namespace,
                    name: app.metadata.name?,
                })
            })
            .collect())
    }

    async fn read_state(&self, id: &ControllerId) -> Result<ControllerState, ClusterError> {
        let app = self.namespaced(id)?.get(&id.name).await?;
        let policy = app
            .data
            .pointer(AUTOMATED_POINTER)
            .filter(|v| !v.is_null())
            .cloned();
        Ok(ControllerState::AutoSync { policy })
    }

    async fn pause(&self, id: &ControllerId) -> Result<(), ClusterError> {
        self.patch_automated(id, Value::Null).await?;
        info!(application = %id, "Disabled automated sync");
        Ok(())
    }

    async fn restore(
        &self,
        id: &ControllerId,
        saved: &ControllerState,
    ) -> Result<(), ClusterError> {
        let ControllerState::AutoSync { policy } = saved else {
            return Err(ClusterError::Malformed {
                kind: "Application".into(),
                name: id.to_string(),
                reason: format!("saved state {saved:?} is not an auto-sync policy"),
            });
        };
        self.patch_automated(id, policy.clone().unwrap_or(Value::Null))
            .await?;
        info!(application = %id, automated = policy.is_some(), "Restored sync policy");
        Ok(())
    }
}
