//! Operator-managed custom resources paused through one field.

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;
use tracing::{debug, info};

use super::{merge_patch_at, ControllerId, ControllerKind, ControllerState, ReconcilingController};
use crate::cluster::ClusterError;
use crate::config::{OperatorControllerConfig, PauseMode};

/// Instances of one operator CRD.
pub struct OperatorResources {
    client: Client,
    resource: ApiResource,
    namespace: Option<String>,
    pointer: String,
    mode: PauseMode,
}

impl OperatorResources {
    #[must_use]
    pub fn new(client: Client, config: &OperatorControllerConfig) -> Self {
        Self {
            client,
            resource: ApiResource {
                group: config.group.clone(),
                version: config.version.clone(),
                api_version: format!("{}/{}", config.group, config.version),
                kind: config.kind.clone(),
                plural: config.plural.clone(),
            },
            namespace: config.namespace.clone(),
            pointer: config.pointer.clone(),
            mode: config.mode,
        }
    }

    fn api_for(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            None => Api::all_with(self.client.clone(), &self.resource),
        }
    }

    fn malformed(&self, id: &ControllerId, reason: String) -> ClusterError {
        ClusterError::Malformed {
            kind: self.resource.kind.clone(),
            name: id.to_string(),
            reason,
        }
    }

    async fn patch_field(&self, id: &ControllerId, value: Value) -> Result<(), ClusterError> {
        let patch = Patch::Merge(merge_patch_at(&self.pointer, value));
        self.api_for(id.namespace.as_deref())
            .patch(&id.name, &PatchParams::default(), &patch)
            .await?;
        Ok(())
    }

    /// Interpret the raw field value for this pause mode.
    fn state_from(&self, id: &ControllerId, raw: Option<&Value>) -> Result<ControllerState, ClusterError> {
        let raw = raw.filter(|v| !v.is_null());
        match self.mode {
            PauseMode::Replicas => match raw {
                None => Ok(ControllerState::Replicas { count: None }),
                Some(v) => v
                    .as_i64()
                    .map(|n| ControllerState::Replicas { count: Some(n) })
                    .ok_or_else(|| self.malformed(id, format!("{} is not an integer", self.pointer))),
            },
            PauseMode::Flag => match raw {
                None => Ok(ControllerState::Flag { paused: None }),
                Some(v) => v
                    .as_bool()
                    .map(|b| ControllerState::Flag { paused: Some(b) })
                    .ok_or_else(|| self.malformed(id, format!("{} is not a boolean", self.pointer))),
            },
        }
    }
}

#[async_trait]
impl ReconcilingController for OperatorResources {
    fn kind(&self) -> ControllerKind {
        ControllerKind::OperatorCr(self.resource.kind.clone())
    }

    async fn enumerate(&self) -> Result<Vec<ControllerId>, ClusterError> {
        let list = match self
            .api_for(self.namespace.as_deref())
            .list(&ListParams::default())
            .await
        {
            Ok(list) => list,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(kind = %self.resource.kind, "CRD not found");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let kind = self.kind();
        Ok(list
            .items
            .into_iter()
            .filter_map(|obj| {
                Some(ControllerId {
                    kind: kind.clone(),
                    namespace: obj.metadata.namespace,
                    name: obj.metadata.name?,
                })
            })
            .collect())
    }

    async fn read_state(&self, id: &ControllerId) -> Result<ControllerState, ClusterError> {
        let obj = self.api_for(id.namespace.as_deref()).get(&id.name).await?;
        self.state_from(id, obj.data.pointer(&self.pointer))
    }

    async fn pause(&self, id: &ControllerId) -> Result<(), ClusterError> {
        let value = match self.mode {
            PauseMode::Replicas => Value::from(0),
            PauseMode::Flag => Value::Bool(true),
        };
        self.patch_field(id, value).await?;
        info!(resource = %id, pointer = %self.pointer, "Paused operator resource");
        Ok(())
    }

    async fn restore(
        &self,
        id: &ControllerId,
        saved: &ControllerState,
    ) -> Result<(), ClusterError> {
        let value = match (self.mode, saved) {
            (PauseMode::Replicas, ControllerState::Replicas { count }) => {
                count.map_or(Value::Null, Value::from)
            }
            (PauseMode::Flag, ControllerState::Flag { paused }) => {
                paused.map_or(Value::Null, Value::Bool)
            }
            _ => {
                return Err(self.malformed(id, format!("saved state {saved:?} does not match mode")));
            }
        };
        self.patch_field(id, value).await?;
        info!(resource = %id, pointer = %self.pointer, "Restored operator resource");
        Ok(())
    }
}
