//! Storage-aware workload drainer.
//!
//! Releases every volume served by the distributed storage engine by scaling
//! the workloads that mount it to zero and waiting for their pods to go away.
//! The drainer never deletes anything; it only changes replica counts.
//!
//! Draining is split in two so the caller can persist original replica counts
//! before anything is mutated:
//! - [`Drainer::plan`] is read-only and resolves owners per volume
//! - [`Drainer::execute`] scales, waits, and re-verifies each volume
//!
//! Every namespace drains concurrently, as do the workloads inside one
//! namespace, so a slow namespace never holds back the start of another.
//! Concurrent cluster API calls are bounded by the configured parallelism;
//! waiting between polls holds no slot. Each workload belongs to exactly one
//! namespace plan, so no two concurrent paths ever touch the same resource.
//!
//! A volume only counts as released once no active pod references its claim
//! and the storage engine no longer reports it attached.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::error::LifecycleError;
use crate::model::{PodInfo, StorageVolume, Workload, WorkloadRef};
use crate::wait::{poll_until, PollPolicy, WaitOutcome};

/// Namespace restriction for system-critical workloads.
#[derive(Debug, Clone)]
pub struct NamespacePolicy {
    /// Namespace where only ingress workloads may be drained.
    pub infra_namespace: String,
    /// Name pattern of those ingress workloads.
    pub ingress_pattern: Regex,
}

impl NamespacePolicy {
    /// Why `workload` must not be drained, if it must not.
    fn exclusion(&self, workload: &WorkloadRef) -> Option<String> {
        if !workload.kind.is_scalable() {
            return Some("daemon-sets are never scaled".to_string());
        }
        if workload.namespace == self.infra_namespace
            && !self.ingress_pattern.is_match(&workload.name)
        {
            return Some(format!(
                "only ingress workloads may be drained in {}",
                self.infra_namespace
            ));
        }
        None
    }
}

/// A workload to scale to zero, with the replica count found at plan time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainTarget {
    pub workload: WorkloadRef,
    pub replicas: i32,
}

/// One volume and what the plan decided for it.
#[derive(Debug, Clone)]
pub struct VolumePlan {
    pub volume: StorageVolume,
    pub owners: Vec<WorkloadRef>,
    /// Owners left alone, with the reason.
    pub excluded: Vec<(WorkloadRef, String)>,
    /// Set when ownership could not be resolved.
    pub error: Option<String>,
}

/// Everything to drain in one namespace.
#[derive(Debug, Clone)]
pub struct NamespacePlan {
    pub namespace: String,
    pub volumes: Vec<VolumePlan>,
    pub targets: Vec<DrainTarget>,
}

/// Read-only drain plan.
#[derive(Debug, Clone, Default)]
pub struct DrainPlan {
    pub namespaces: Vec<NamespacePlan>,
    /// Volumes without a bound claim; nothing to drain.
    pub unclaimed: Vec<StorageVolume>,
}

impl DrainPlan {
    /// Every workload the plan will scale.
    pub fn targets(&self) -> impl Iterator<Item = &DrainTarget> {
        self.namespaces.iter().flat_map(|ns| ns.targets.iter())
    }

    #[must_use]
    pub fn volume_count(&self) -> usize {
        self.unclaimed.len() + self.namespaces.iter().map(|ns| ns.volumes.len()).sum::<usize>()
    }
}

/// Final release classification of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeClassification {
    /// No active pod references the claim.
    Unused,
    /// Active pods still reference the claim.
    StillInUse,
    /// The volume could not be drained or verified.
    Errored,
}

/// Per-volume result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeOutcome {
    pub volume: String,
    pub claim: Option<String>,
    pub classification: VolumeClassification,
    pub owners: Vec<String>,
    /// Active pods still referencing the claim.
    pub active_pods: Vec<String>,
    /// Last attachment state reported by the storage engine.
    pub engine_state: Option<String>,
    pub notes: Vec<String>,
    pub error: Option<String>,
}

/// What happened to one workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadAction {
    Scaled,
    AlreadyZero,
    WouldScale,
    Failed,
}

/// Per-workload result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadOutcome {
    pub workload: WorkloadRef,
    pub original_replicas: i32,
    pub action: WorkloadAction,
    /// Whether every pod of the workload was observed gone.
    pub terminated: bool,
    pub warning: Option<String>,
}

/// Accumulated drain results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DrainReport {
    pub volumes: Vec<VolumeOutcome>,
    pub workloads: Vec<WorkloadOutcome>,
    pub cancelled: bool,
}

impl DrainReport {
    fn count(&self, class: VolumeClassification) -> usize {
        self.volumes.iter().filter(|v| v.classification == class).count()
    }

    #[must_use]
    pub fn unused(&self) -> usize {
        self.count(VolumeClassification::Unused)
    }

    #[must_use]
    pub fn still_in_use(&self) -> usize {
        self.count(VolumeClassification::StillInUse)
    }

    #[must_use]
    pub fn errored(&self) -> usize {
        self.count(VolumeClassification::Errored)
    }

    /// Warnings from workloads whose pods outlived the wait budget.
    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.workloads.iter().filter_map(|w| w.warning.as_deref())
    }
}

/// Whether an engine attachment state means a node still holds the volume.
fn engine_holds(state: &str) -> bool {
    matches!(state, "attached" | "attaching" | "detaching")
}

/// Drains storage-engine volumes.
#[derive(Clone)]
pub struct Drainer {
    cluster: Arc<dyn ClusterApi>,
    policy: NamespacePolicy,
    wait: PollPolicy,
    /// Bounds concurrent cluster API calls across all namespaces.
    api_slots: Arc<Semaphore>,
    dry_run: bool,
}

impl Drainer {
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        policy: NamespacePolicy,
        wait: PollPolicy,
        parallelism: usize,
        dry_run: bool,
    ) -> Self {
        Self {
            cluster,
            policy,
            wait,
            api_slots: Arc::new(Semaphore::new(parallelism.max(1))),
            dry_run,
        }
    }

    /// Resolve owning workloads for every volume. Read-only.
    pub async fn plan(&self, volumes: &[StorageVolume]) -> DrainPlan {
        let mut plan = DrainPlan::default();
        let mut by_namespace: BTreeMap<String, Vec<StorageVolume>> = BTreeMap::new();

        for volume in volumes {
            match &volume.claim {
                Some(claim) => by_namespace
                    .entry(claim.namespace.clone())
                    .or_default()
                    .push(volume.clone()),
                None => plan.unclaimed.push(volume.clone()),
            }
        }

        for (namespace, volumes) in by_namespace {
            plan.namespaces.push(self.plan_namespace(namespace, volumes).await);
        }
        plan
    }

    async fn plan_namespace(&self, namespace: String, volumes: Vec<StorageVolume>) -> NamespacePlan {
        let workloads = match self.cluster.list_workloads(&namespace).await {
            Ok(workloads) => workloads,
            Err(e) => {
                warn!(namespace = %namespace, error = %e, "Failed to list workloads");
                let error = format!("failed to list workloads: {e}");
                return NamespacePlan {
                    namespace,
                    volumes: volumes
                        .into_iter()
                        .map(|volume| VolumePlan {
                            volume,
                            owners: vec![],
                            excluded: vec![],
                            error: Some(error.clone()),
                        })
                        .collect(),
                    targets: vec![],
                };
            }
        };

        let mut targets: Vec<DrainTarget> = Vec::new();
        let mut volume_plans = Vec::new();

        for volume in volumes {
            let claim = volume.claim.as_ref().map(|c| c.name.as_str()).unwrap_or_default();
            let mut owners = Vec::new();
            let mut excluded = Vec::new();

            for workload in workloads.iter().filter(|w| w.uses_claim(claim)) {
                let reference = workload.reference.clone();
                if let Some(reason) = self.policy.exclusion(&reference) {
                    debug!(workload = %reference, reason = %reason, "Excluding workload");
                    excluded.push((reference, reason));
                    continue;
                }
                if !targets.iter().any(|t| t.workload == reference) {
                    targets.push(target_for(workload));
                }
                owners.push(reference);
            }

            if owners.is_empty() && excluded.is_empty() {
                info!(volume = %volume.name, claim, "No owning workload, not in use");
            }
            volume_plans.push(VolumePlan {
                volume,
                owners,
                excluded,
                error: None,
            });
        }

        NamespacePlan {
            namespace,
            volumes: volume_plans,
            targets,
        }
    }

    /// Scale every planned workload to zero, wait for its pods, and classify
    /// each volume. Never fails as a whole; errors land in the report.
    pub async fn execute(&self, plan: &DrainPlan, cancel: &CancellationToken) -> DrainReport {
        info!(
            namespaces = plan.namespaces.len(),
            volumes = plan.volume_count(),
            "Starting drain"
        );
        let mut report = DrainReport::default();

        let unclaimed = join_all(plan.unclaimed.iter().map(|volume| async move {
            let mut outcome = VolumeOutcome {
                volume: volume.name.clone(),
                claim: None,
                classification: VolumeClassification::Unused,
                owners: vec![],
                active_pods: vec![],
                engine_state: None,
                notes: vec!["no bound claim".to_string()],
                error: None,
            };
            self.await_detach(&mut outcome, cancel).await;
            outcome
        }));
        let namespaces = join_all(plan.namespaces.iter().map(|ns| self.drain_namespace(ns, cancel)));
        let (unclaimed, namespace_reports) = futures::join!(unclaimed, namespaces);
        report.volumes.extend(unclaimed);

        for ns in namespace_reports {
            report.volumes.extend(ns.volumes);
            report.workloads.extend(ns.workloads);
            report.cancelled |= ns.cancelled;
        }
        report.cancelled |= cancel.is_cancelled();
        report.volumes.sort_by(|a, b| a.volume.cmp(&b.volume));

        info!(
            unused = report.unused(),
            still_in_use = report.still_in_use(),
            errored = report.errored(),
            "Drain finished"
        );
        report
    }

    async fn drain_namespace(&self, plan: &NamespacePlan, cancel: &CancellationToken) -> DrainReport {
        info!(
            namespace = %plan.namespace,
            volumes = plan.volumes.len(),
            workloads = plan.targets.len(),
            "Draining namespace"
        );

        let workloads: Vec<WorkloadOutcome> =
            join_all(plan.targets.iter().map(|target| self.drain_workload(target, cancel))).await;

        let pods = {
            let _slot = self.api_slots.acquire().await.ok();
            self.cluster.list_pods(Some(&plan.namespace)).await
        };
        let volumes = join_all(
            plan.volumes
                .iter()
                .map(|volume_plan| self.verify_volume(volume_plan, &pods, &workloads, cancel)),
        )
        .await;

        DrainReport {
            volumes,
            workloads,
            cancelled: cancel.is_cancelled(),
        }
    }

    async fn drain_workload(&self, target: &DrainTarget, cancel: &CancellationToken) -> WorkloadOutcome {
        let workload = &target.workload;
        let mut outcome = WorkloadOutcome {
            workload: workload.clone(),
            original_replicas: target.replicas,
            action: WorkloadAction::AlreadyZero,
            terminated: false,
            warning: None,
        };

        if self.dry_run {
            info!(workload = %workload, replicas = target.replicas, "[DRY-RUN] Would scale to 0");
            outcome.action = WorkloadAction::WouldScale;
            return outcome;
        }

        if target.replicas > 0 {
            let scaled = {
                let _slot = self.api_slots.acquire().await.ok();
                self.cluster.scale_workload(workload, 0).await
            };
            if let Err(e) = scaled {
                warn!(workload = %workload, error = %e, "Failed to scale workload");
                outcome.action = WorkloadAction::Failed;
                outcome.warning = Some(format!("failed to scale {workload}: {e}"));
                return outcome;
            }
            info!(workload = %workload, from = target.replicas, "Scaled to 0");
            outcome.action = WorkloadAction::Scaled;
        } else {
            debug!(workload = %workload, "Already at 0 replicas");
        }

        let wait = poll_until(self.wait, cancel, || async move {
            let pods = {
                let _slot = self.api_slots.acquire().await.ok();
                self.cluster.list_pods(Some(&workload.namespace)).await
            };
            match pods {
                Ok(pods) => {
                    let active = pods
                        .iter()
                        .filter(|p| p.owner.as_ref() == Some(workload) && p.phase.is_active())
                        .count();
                    debug!(workload = %workload, active, "Waiting for pods to terminate");
                    (active == 0).then_some(())
                }
                Err(e) => {
                    debug!(workload = %workload, error = %e, "Pod listing failed, retrying");
                    None
                }
            }
        })
        .await;

        match wait {
            WaitOutcome::Ready(()) => outcome.terminated = true,
            WaitOutcome::TimedOut => {
                let err = LifecycleError::DrainTimeout {
                    subject: format!("pods of {workload}"),
                    waited: self.wait.max_wait,
                };
                warn!(workload = %workload, "{err}; continuing");
                outcome.warning = Some(err.to_string());
            }
            WaitOutcome::Cancelled => {
                outcome.warning = Some(format!("wait for {workload} cancelled"));
            }
        }
        outcome
    }

    async fn verify_volume(
        &self,
        plan: &VolumePlan,
        pods: &Result<Vec<PodInfo>, crate::cluster::ClusterError>,
        workloads: &[WorkloadOutcome],
        cancel: &CancellationToken,
    ) -> VolumeOutcome {
        let volume = &plan.volume;
        let claim_name = volume.claim.as_ref().map(|c| c.name.clone());
        let mut outcome = VolumeOutcome {
            volume: volume.name.clone(),
            claim: volume.claim.as_ref().map(ToString::to_string),
            classification: VolumeClassification::Unused,
            owners: plan.owners.iter().map(ToString::to_string).collect(),
            active_pods: vec![],
            engine_state: None,
            notes: plan
                .excluded
                .iter()
                .map(|(w, reason)| format!("{w} skipped: {reason}"))
                .collect(),
            error: None,
        };

        if plan.owners.is_empty() && plan.excluded.is_empty() && plan.error.is_none() {
            outcome.notes.push("no owning workload".to_string());
        }

        let failed_owners: Vec<String> = workloads
            .iter()
            .filter(|w| w.action == WorkloadAction::Failed && plan.owners.contains(&w.workload))
            .map(|w| w.workload.to_string())
            .collect();

        if let Some(ref error) = plan.error {
            outcome.classification = VolumeClassification::Errored;
            outcome.error = Some(error.clone());
            return outcome;
        }
        if !failed_owners.is_empty() {
            outcome.classification = VolumeClassification::Errored;
            outcome.error = Some(format!("failed to scale {}", failed_owners.join(", ")));
            return outcome;
        }

        match pods {
            Ok(pods) => {
                let claim = claim_name.unwrap_or_default();
                outcome.active_pods = pods
                    .iter()
                    .filter(|p| p.phase.is_active() && p.references_claim(&claim))
                    .map(|p| format!("{}/{}", p.namespace, p.name))
                    .collect();
                if !outcome.active_pods.is_empty() {
                    outcome.classification = VolumeClassification::StillInUse;
                }
            }
            Err(e) => {
                outcome.classification = VolumeClassification::Errored;
                outcome.error = Some(format!("failed to verify pod usage: {e}"));
            }
        }

        if outcome.classification == VolumeClassification::Unused {
            self.await_detach(&mut outcome, cancel).await;
        } else {
            outcome.engine_state = self.engine_state(&volume.name).await;
        }
        outcome
    }

    /// Wait for the storage engine to let go of a volume no pod uses any more.
    /// A volume the engine still holds is still in use. Dry runs only look once.
    async fn await_detach(&self, outcome: &mut VolumeOutcome, cancel: &CancellationToken) {
        let volume = outcome.volume.as_str();
        let state = self.engine_state(volume).await;
        let held = state.as_deref().is_some_and(engine_holds);
        if !held || self.dry_run {
            if held {
                outcome.classification = VolumeClassification::StillInUse;
                outcome.notes.push(format!("storage engine reports {volume} attached"));
            }
            outcome.engine_state = state;
            return;
        }

        debug!(volume, "Waiting for storage engine to detach");
        let wait = poll_until(self.wait, cancel, || async move {
            let state = self.engine_state(volume).await;
            (!state.as_deref().is_some_and(engine_holds)).then_some(state)
        })
        .await;

        match wait {
            WaitOutcome::Ready(state) => outcome.engine_state = state,
            WaitOutcome::TimedOut | WaitOutcome::Cancelled => {
                warn!(volume, "Storage engine still holds the volume");
                outcome.engine_state = self.engine_state(volume).await;
                outcome.classification = VolumeClassification::StillInUse;
                outcome.notes.push(format!(
                    "storage engine still reports {volume} attached after {}s",
                    self.wait.max_wait.as_secs()
                ));
            }
        }
    }

    async fn engine_state(&self, volume: &str) -> Option<String> {
        let _slot = self.api_slots.acquire().await.ok();
        match self.cluster.storage_engine_state(volume).await {
            Ok(state) => state,
            Err(e) => {
                debug!(volume, error = %e, "Storage engine state unavailable");
                None
            }
        }
    }
}

fn target_for(workload: &Workload) -> DrainTarget {
    DrainTarget {
        workload: workload.reference.clone(),
        replicas: workload.replicas,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkloadKind;

    fn policy() -> NamespacePolicy {
        NamespacePolicy {
            infra_namespace: "kube-system".into(),
            ingress_pattern: Regex::new("^(traefik|ingress-nginx)").unwrap(),
        }
    }

    fn reference(kind: WorkloadKind, namespace: &str, name: &str) -> WorkloadRef {
        WorkloadRef {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    #[test]
    fn test_daemonsets_always_excluded() {
        let ds = reference(WorkloadKind::DaemonSet, "apps", "node-agent");
        assert!(policy().exclusion(&ds).is_some());
    }

    #[test]
    fn test_infra_namespace_only_ingress() {
        let p = policy();
        assert!(p
            .exclusion(&reference(WorkloadKind::Deployment, "kube-system", "coredns"))
            .is_some());
        assert!(p
            .exclusion(&reference(WorkloadKind::Deployment, "kube-system", "traefik"))
            .is_none());
        assert!(p
            .exclusion(&reference(WorkloadKind::Deployment, "apps", "coredns"))
            .is_none());
    }

    #[test]
    fn test_engine_states_that_hold_a_volume() {
        assert!(engine_holds("attached"));
        assert!(engine_holds("detaching"));
        assert!(!engine_holds("detached"));
        assert!(!engine_holds("creating"));
    }

    #[test]
    fn test_report_counts() {
        let outcome = |name: &str, classification| VolumeOutcome {
            volume: name.into(),
            claim: None,
            classification,
            owners: vec![],
            active_pods: vec![],
            engine_state: None,
            notes: vec![],
            error: None,
        };
        let report = DrainReport {
            volumes: vec![
                outcome("a", VolumeClassification::Unused),
                outcome("b", VolumeClassification::StillInUse),
                outcome("c", VolumeClassification::Errored),
                outcome("d", VolumeClassification::Unused),
            ],
            ..DrainReport::default()
        };
        assert_eq!(report.unused(), 2);
        assert_eq!(report.still_in_use(), 1);
        assert_eq!(report.errored(), 1);
    }
}
