//! kube-rs implementation of [`ClusterApi`].

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::core::v1::{Node, PersistentVolume, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use serde_json::json;
use tracing::debug;

use super::{AccessCheck, ClusterApi, ClusterError, PersistentVolumeInfo};
use crate::model::{NodeReadiness, PodInfo, PodPhase, Workload, WorkloadKind, WorkloadRef};

/// Longhorn `Volume` API resource definition.
fn longhorn_volume_api() -> ApiResource {
    ApiResource {
        group: "longhorn.io".to_string(),
        version: "v1beta2".to_string(),
        api_version: "longhorn.io/v1beta2".to_string(),
        kind: "Volume".to_string(),
        plural: "volumes".to_string(),
    }
}

/// Cluster access through the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    /// Kubernetes client.
    client: Client,
    /// Namespace holding the storage engine's volume objects.
    engine_namespace: String,
}

impl KubeCluster {
    /// Wrap an existing client.
    #[must_use]
    pub fn new(client: Client, engine_namespace: impl Into<String>) -> Self {
        Self {
            client,
            engine_namespace: engine_namespace.into(),
        }
    }

    /// Connect using a kubeconfig path, or the default loading rules when `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the kubeconfig cannot be read or the client cannot be created.
    pub async fn connect(
        kubeconfig: Option<&Path>,
        context: Option<&str>,
        engine_namespace: impl Into<String>,
    ) -> Result<Self, ClusterError> {
        let options = KubeConfigOptions {
            context: context.map(ToString::to_string),
            ..KubeConfigOptions::default()
        };

        let config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    ClusterError::Config(format!(
                        "Failed to read kubeconfig from {}: {e}",
                        path.display()
                    ))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| ClusterError::Config(e.to_string()))?
            }
            None if context.is_some() => Config::from_kubeconfig(&options)
                .await
                .map_err(|e| ClusterError::Config(e.to_string()))?,
            None => Config::infer()
                .await
                .map_err(|e| ClusterError::Config(e.to_string()))?,
        };

        let client = Client::try_from(config)?;
        Ok(Self::new(client, engine_namespace))
    }

    /// Underlying client, shared with the controller handlers.
    #[must_use]
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    async fn replica_set_owners(
        &self,
        namespace: Option<&str>,
    ) -> Result<HashMap<(String, String), Option<String>>, ClusterError> {
        let api: Api<ReplicaSet> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|rs| {
                let ns = rs.metadata.namespace.clone()?;
                let name = rs.metadata.name.clone()?;
                let deployment = owner_of_kind(rs.metadata.owner_references.as_deref(), "Deployment");
                Some(((ns, name), deployment))
            })
            .collect())
    }
}

/// Name of the controlling owner of `kind`, if any.
fn owner_of_kind(owners: Option<&[OwnerReference]>, kind: &str) -> Option<String> {
    owners?
        .iter()
        .find(|o| o.kind == kind && o.controller.unwrap_or(true))
        .map(|o| o.name.clone())
}

/// Claim names mounted by a pod spec.
fn pod_claims(spec: Option<&PodSpec>) -> Vec<String> {
    spec.and_then(|s| s.volumes.as_ref())
        .map(|volumes| {
            volumes
                .iter()
                .filter_map(|v| v.persistent_volume_claim.as_ref())
                .map(|pvc| pvc.claim_name.clone())
                .collect()
        })
        .unwrap_or_default()
}

fn workload_ref(kind: WorkloadKind, namespace: &str, name: Option<&String>) -> Option<WorkloadRef> {
    Some(WorkloadRef {
        kind,
        namespace: namespace.to_string(),
        name: name?.clone(),
    })
}

/// Resolve a pod's top-level owner, walking ReplicaSet → Deployment.
fn resolve_pod_owner(
    pod: &Pod,
    namespace: &str,
    replica_sets: &HashMap<(String, String), Option<String>>,
) -> Option<WorkloadRef> {
    let owner = pod
        .metadata
        .owner_references
        .as_deref()?
        .iter()
        .find(|o| o.controller.unwrap_or(false))
        .or_else(|| pod.metadata.owner_references.as_deref()?.first())?;

    let kind = match owner.kind.as_str() {
        "ReplicaSet" => {
            let key = (namespace.to_string(), owner.name.clone());
            return match replica_sets.get(&key) {
                Some(Some(deployment)) => workload_ref(WorkloadKind::Deployment, namespace, Some(deployment)),
                _ => workload_ref(WorkloadKind::ReplicaSet, namespace, Some(&owner.name)),
            };
        }
        "StatefulSet" => WorkloadKind::StatefulSet,
        "DaemonSet" => WorkloadKind::DaemonSet,
        "Deployment" => WorkloadKind::Deployment,
        _ => return None,
    };
    workload_ref(kind, namespace, Some(&owner.name))
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn server_version(&self) -> Result<String, ClusterError> {
        let info = self.client.apiserver_version().await?;
        Ok(info.git_version)
    }

    async fn node_readiness(&self) -> Result<Vec<NodeReadiness>, ClusterError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;

        Ok(list
            .items
            .into_iter()
            .map(|node| {
                let ready = node
                    .status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .is_some_and(|conditions| {
                        conditions
                            .iter()
                            .any(|c| c.type_ == "Ready" && c.status == "True")
                    });
                NodeReadiness {
                    name: node.metadata.name.unwrap_or_default(),
                    ready,
                }
            })
            .collect())
    }

    async fn list_persistent_volumes(&self) -> Result<Vec<PersistentVolumeInfo>, ClusterError> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;

        list.items
            .into_iter()
            .map(|pv| {
                let name = pv.metadata.name.clone().ok_or_else(|| ClusterError::Malformed {
                    kind: "PersistentVolume".into(),
                    name: "<unnamed>".into(),
                    reason: "missing metadata.name".into(),
                })?;
                let spec = pv.spec.unwrap_or_default();
                let claim = spec
                    .claim_ref
                    .and_then(|r| Some((r.namespace?, r.name?)));
                Ok(PersistentVolumeInfo {
                    name,
                    storage_class: spec.storage_class_name,
                    claim,
                    phase: pv
                        .status
                        .and_then(|s| s.phase)
                        .unwrap_or_else(|| "Unknown".to_string()),
                })
            })
            .collect()
    }

    async fn list_workloads(&self, namespace: &str) -> Result<Vec<Workload>, ClusterError> {
        let params = ListParams::default();
        let mut workloads = Vec::new();

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        for d in deployments.list(&params).await?.items {
            let Some(reference) = workload_ref(WorkloadKind::Deployment, namespace, d.metadata.name.as_ref()) else {
                continue;
            };
            let spec = d.spec.unwrap_or_default();
            workloads.push(Workload {
                reference,
                replicas: spec.replicas.unwrap_or(1),
                template_claims: pod_claims(spec.template.spec.as_ref()),
                claim_templates: vec![],
            });
        }

        let stateful_sets: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        for s in stateful_sets.list(&params).await?.items {
            let Some(reference) = workload_ref(WorkloadKind::StatefulSet, namespace, s.metadata.name.as_ref()) else {
                continue;
            };
            let spec = s.spec.unwrap_or_default();
            workloads.push(Workload {
                reference,
                replicas: spec.replicas.unwrap_or(1),
                template_claims: pod_claims(spec.template.spec.as_ref()),
                claim_templates: spec
                    .volume_claim_templates
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|t| t.metadata.name)
                    .collect(),
            });
        }

        // ReplicaSets owned by a Deployment are scaled through their Deployment.
        let replica_sets: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        for rs in replica_sets.list(&params).await?.items {
            if owner_of_kind(rs.metadata.owner_references.as_deref(), "Deployment").is_some() {
                continue;
            }
            let Some(reference) = workload_ref(WorkloadKind::ReplicaSet, namespace, rs.metadata.name.as_ref()) else {
                continue;
            };
            let spec = rs.spec.unwrap_or_default();
            workloads.push(Workload {
                reference,
                replicas: spec.replicas.unwrap_or(1),
                template_claims: pod_claims(spec.template.as_ref().and_then(|t| t.spec.as_ref())),
                claim_templates: vec![],
            });
        }

        let daemon_sets: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        for ds in daemon_sets.list(&params).await?.items {
            let Some(reference) = workload_ref(WorkloadKind::DaemonSet, namespace, ds.metadata.name.as_ref()) else {
                continue;
            };
            let spec = ds.spec.unwrap_or_default();
            workloads.push(Workload {
                reference,
                replicas: 0,
                template_claims: pod_claims(spec.template.spec.as_ref()),
                claim_templates: vec![],
            });
        }

        debug!(namespace, count = workloads.len(), "Listed workloads");
        Ok(workloads)
    }

    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<PodInfo>, ClusterError> {
        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let replica_sets = self.replica_set_owners(namespace).await?;
        let list = api.list(&ListParams::default()).await?;

        Ok(list
            .items
            .iter()
            .filter_map(|pod| {
                let ns = pod.metadata.namespace.clone()?;
                let name = pod.metadata.name.clone()?;
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .map_or(PodPhase::Unknown, PodPhase::parse);
                Some(PodInfo {
                    owner: resolve_pod_owner(pod, &ns, &replica_sets),
                    claims: pod_claims(pod.spec.as_ref()),
                    namespace: ns,
                    name,
                    phase,
                })
            })
            .collect())
    }

    async fn scale_workload(
        &self,
        workload: &WorkloadRef,
        replicas: i32,
    ) -> Result<(), ClusterError> {
        let patch = Patch::Merge(json!({ "spec": { "replicas": replicas } }));
        let params = PatchParams::default();
        let ns = workload.namespace.as_str();
        let name = workload.name.as_str();

        match workload.kind {
            WorkloadKind::Deployment => {
                Api::<Deployment>::namespaced(self.client.clone(), ns)
                    .patch(name, &params, &patch)
                    .await?;
            }
            WorkloadKind::StatefulSet => {
                Api::<StatefulSet>::namespaced(self.client.clone(), ns)
                    .patch(name, &params, &patch)
                    .await?;
            }
            WorkloadKind::ReplicaSet => {
                Api::<ReplicaSet>::namespaced(self.client.clone(), ns)
                    .patch(name, &params, &patch)
                    .await?;
            }
            WorkloadKind::DaemonSet => {
                return Err(ClusterError::Malformed {
                    kind: "DaemonSet".into(),
                    name: workload.to_string(),
                    reason: "daemon-sets cannot be scaled".into(),
                });
            }
        }
        Ok(())
    }

    async fn storage_engine_state(&self, volume: &str) -> Result<Option<String>, ClusterError> {
        let api: Api<DynamicObject> = Api::namespaced_with(
            self.client.clone(),
            &self.engine_namespace,
            &longhorn_volume_api(),
        );

        let state = match api.get_opt(volume).await {
            Ok(obj) => obj.and_then(|o| {
                o.data
                    .get("status")
                    .and_then(|s| s.get("state"))
                    .and_then(|s| s.as_str())
                    .map(ToString::to_string)
            }),
            // Engine CRDs not installed.
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e.into()),
        };
        Ok(state)
    }

    async fn can_i(&self, check: &AccessCheck) -> Result<bool, ClusterError> {
        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    verb: Some(check.verb.to_string()),
                    group: Some(check.group.to_string()),
                    resource: Some(check.resource.to_string()),
                    ..ResourceAttributes::default()
                }),
                ..SelfSubjectAccessReviewSpec::default()
            },
            ..SelfSubjectAccessReview::default()
        };

        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let response = api.create(&PostParams::default(), &review).await?;
        let allowed = response.status.is_some_and(|s| s.allowed);
        debug!(check = %check, allowed, "Access review");
        Ok(allowed)
    }
}
