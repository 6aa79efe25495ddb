//! In-memory control planes for driving the orchestrator in tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use cluster_lifecycle::cluster::{AccessCheck, ClusterApi, ClusterError, PersistentVolumeInfo};
use cluster_lifecycle::config::LifecycleConfig;
use cluster_lifecycle::controllers::{
    ControllerId, ControllerKind, ControllerState, ReconcilingController,
};
use cluster_lifecycle::hypervisor::{Hypervisor, HypervisorError, VmRecord};
use cluster_lifecycle::model::{
    ManagedVm, NodeReadiness, PodInfo, PodPhase, PowerState, Workload, WorkloadKind, WorkloadRef,
};
use cluster_lifecycle::orchestrator::{open_checkpoint, Backends, Orchestrator, RunOptions};
use cluster_lifecycle::state::{Direction, RunCheckpoint};

/// Power-state queries a VM needs before a requested transition lands.
const TRANSITION_POLLS: u32 = 2;

// =============================================================================
// Hypervisor
// =============================================================================

/// Something the fake hypervisor observed, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    ShutdownRequested(u32),
    StartRequested(u32),
    Reached(u32, PowerState),
}

struct FakeVm {
    record: VmRecord,
    boot_order: Option<u32>,
    /// Reading the VM's config is forbidden.
    config_denied: bool,
    pending: Option<(PowerState, u32)>,
    stuck: bool,
}

/// Hypervisor whose VMs reach a requested state after a few polls.
pub struct FakeHypervisor {
    vms: Mutex<Vec<FakeVm>>,
    events: Mutex<Vec<Event>>,
    config_reads: Mutex<Vec<u32>>,
    pub ping_fails: AtomicBool,
}

impl FakeHypervisor {
    pub fn new(vms: Vec<(VmRecord, u32)>) -> Self {
        let hypervisor = Self {
            vms: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            config_reads: Mutex::new(Vec::new()),
            ping_fails: AtomicBool::new(false),
        };
        for (record, order) in vms {
            hypervisor.add(record, Some(order), false);
        }
        hypervisor
    }

    pub fn add(&self, record: VmRecord, boot_order: Option<u32>, config_denied: bool) {
        self.vms.lock().unwrap().push(FakeVm {
            record,
            boot_order,
            config_denied,
            pending: None,
            stuck: false,
        });
    }

    /// VMs whose config was read, in order.
    pub fn config_reads(&self) -> Vec<u32> {
        self.config_reads.lock().unwrap().clone()
    }

    /// Requested transitions of `id` never complete.
    pub fn stick(&self, id: u32) {
        if let Some(vm) = self.vms.lock().unwrap().iter_mut().find(|v| v.record.id == id) {
            vm.stuck = true;
        }
    }

    pub fn power(&self, id: u32) -> PowerState {
        self.vms
            .lock()
            .unwrap()
            .iter()
            .find(|v| v.record.id == id)
            .map_or(PowerState::Unknown, |v| v.record.power)
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| !matches!(e, Event::Reached(..)))
            .collect()
    }

    fn request(&self, id: u32, target: PowerState, event: Event) -> Result<(), HypervisorError> {
        let mut vms = self.vms.lock().unwrap();
        let vm = vms
            .iter_mut()
            .find(|v| v.record.id == id)
            .ok_or_else(|| HypervisorError::NotFound(id.to_string()))?;
        vm.pending = Some((target, TRANSITION_POLLS));
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn ping(&self) -> Result<(), HypervisorError> {
        if self.ping_fails.load(Ordering::SeqCst) {
            return Err(HypervisorError::Api {
                status: 401,
                message: "authentication failure".into(),
            });
        }
        Ok(())
    }

    async fn list_vms(&self, tag: Option<&str>) -> Result<Vec<VmRecord>, HypervisorError> {
        Ok(self
            .vms
            .lock()
            .unwrap()
            .iter()
            .filter(|v| tag.map_or(true, |t| v.record.tags.iter().any(|x| x == t)))
            .map(|v| v.record.clone())
            .collect())
    }

    async fn boot_order(&self, vm: &VmRecord) -> Result<Option<u32>, HypervisorError> {
        self.config_reads.lock().unwrap().push(vm.id);
        let vms = self.vms.lock().unwrap();
        let fake = vms
            .iter()
            .find(|v| v.record.id == vm.id)
            .ok_or_else(|| HypervisorError::NotFound(vm.id.to_string()))?;
        if fake.config_denied {
            return Err(HypervisorError::Api {
                status: 403,
                message: "Permission check failed".into(),
            });
        }
        Ok(fake.boot_order)
    }

    async fn power_state(&self, vm: &ManagedVm) -> Result<PowerState, HypervisorError> {
        let mut vms = self.vms.lock().unwrap();
        let fake = vms
            .iter_mut()
            .find(|v| v.record.id == vm.id)
            .ok_or_else(|| HypervisorError::NotFound(vm.id.to_string()))?;

        if let Some((target, remaining)) = fake.pending {
            if !fake.stuck {
                if remaining == 0 {
                    fake.record.power = target;
                    fake.pending = None;
                    self.events.lock().unwrap().push(Event::Reached(vm.id, target));
                } else {
                    fake.pending = Some((target, remaining - 1));
                }
            }
        }
        Ok(fake.record.power)
    }

    async fn request_shutdown(
        &self,
        vm: &ManagedVm,
        _timeout: Duration,
    ) -> Result<(), HypervisorError> {
        self.request(vm.id, PowerState::Stopped, Event::ShutdownRequested(vm.id))
    }

    async fn request_start(&self, vm: &ManagedVm) -> Result<(), HypervisorError> {
        self.request(vm.id, PowerState::Running, Event::StartRequested(vm.id))
    }
}

pub fn vm_record(id: u32, role_tag: &str, boot_order: u32, power: PowerState) -> (VmRecord, u32) {
    let record = VmRecord {
        id,
        name: format!("k8s-{role_tag}-{boot_order}"),
        node: "pve1".into(),
        tags: vec!["k8s".into(), role_tag.into()],
        power,
    };
    (record, boot_order)
}

// =============================================================================
// Cluster
// =============================================================================

/// Cluster whose workloads drop their pods as soon as they are scaled to zero.
///
/// The storage engine reports a volume attached while an active pod uses its
/// claim, and detached otherwise.
pub struct FakeCluster {
    volumes: Vec<PersistentVolumeInfo>,
    workloads: Mutex<Vec<Workload>>,
    pods: Mutex<Vec<PodInfo>>,
    /// Workloads whose pods ignore scale-down.
    stuck: Mutex<HashSet<String>>,
    /// Volumes the storage engine never detaches.
    held: Mutex<HashSet<String>>,
    /// Access checks answered with a denial, by display form.
    denied: Mutex<HashSet<String>>,
    scale_calls: Mutex<Vec<(WorkloadRef, i32)>>,
    scaled_at: Mutex<HashMap<String, Duration>>,
    created: Instant,
    pub api_down: AtomicBool,
}

impl FakeCluster {
    pub fn new(volumes: Vec<PersistentVolumeInfo>, workloads: Vec<Workload>) -> Self {
        let pods = workloads
            .iter()
            .flat_map(|w| pods_for(w, w.replicas))
            .collect();
        Self {
            volumes,
            workloads: Mutex::new(workloads),
            pods: Mutex::new(pods),
            stuck: Mutex::new(HashSet::new()),
            held: Mutex::new(HashSet::new()),
            denied: Mutex::new(HashSet::new()),
            scale_calls: Mutex::new(Vec::new()),
            scaled_at: Mutex::new(HashMap::new()),
            created: Instant::now(),
            api_down: AtomicBool::new(false),
        }
    }

    pub fn stick(&self, workload: &str) {
        self.stuck.lock().unwrap().insert(workload.to_string());
    }

    /// The storage engine keeps `volume` attached no matter what.
    pub fn hold_attached(&self, volume: &str) {
        self.held.lock().unwrap().insert(volume.to_string());
    }

    /// Deny an access check, e.g. `"patch statefulsets.apps"`.
    pub fn deny(&self, check: &str) {
        self.denied.lock().unwrap().insert(check.to_string());
    }

    /// Time since creation at which `workload` was first scaled.
    pub fn scaled_at(&self, workload: &str) -> Option<Duration> {
        self.scaled_at.lock().unwrap().get(workload).copied()
    }

    pub fn scale_calls(&self) -> Vec<(WorkloadRef, i32)> {
        self.scale_calls.lock().unwrap().clone()
    }

    pub fn replicas(&self, name: &str) -> Option<i32> {
        self.workloads
            .lock()
            .unwrap()
            .iter()
            .find(|w| w.reference.name == name)
            .map(|w| w.replicas)
    }

    pub fn active_pods(&self, namespace: &str) -> usize {
        self.pods
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.namespace == namespace && p.phase.is_active())
            .count()
    }

    fn check_api(&self) -> Result<(), ClusterError> {
        if self.api_down.load(Ordering::SeqCst) {
            return Err(ClusterError::Config("connection refused".into()));
        }
        Ok(())
    }
}

fn pods_for(workload: &Workload, replicas: i32) -> Vec<PodInfo> {
    let reference = &workload.reference;
    (0..replicas.max(0))
        .map(|ordinal| {
            let mut claims = workload.template_claims.clone();
            claims.extend(
                workload
                    .claim_templates
                    .iter()
                    .map(|t| format!("{t}-{}-{ordinal}", reference.name)),
            );
            PodInfo {
                namespace: reference.namespace.clone(),
                name: format!("{}-{ordinal}", reference.name),
                phase: PodPhase::Running,
                owner: Some(reference.clone()),
                claims,
            }
        })
        .collect()
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn server_version(&self) -> Result<String, ClusterError> {
        self.check_api()?;
        Ok("v1.31.2".into())
    }

    async fn node_readiness(&self) -> Result<Vec<NodeReadiness>, ClusterError> {
        self.check_api()?;
        Ok((0..7)
            .map(|i| NodeReadiness {
                name: format!("node-{i}"),
                ready: true,
            })
            .collect())
    }

    async fn list_persistent_volumes(&self) -> Result<Vec<PersistentVolumeInfo>, ClusterError> {
        self.check_api()?;
        Ok(self.volumes.clone())
    }

    async fn list_workloads(&self, namespace: &str) -> Result<Vec<Workload>, ClusterError> {
        self.check_api()?;
        Ok(self
            .workloads
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.reference.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<PodInfo>, ClusterError> {
        self.check_api()?;
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|p| namespace.map_or(true, |ns| p.namespace == ns))
            .cloned()
            .collect())
    }

    async fn scale_workload(
        &self,
        workload: &WorkloadRef,
        replicas: i32,
    ) -> Result<(), ClusterError> {
        self.check_api()?;
        if !workload.kind.is_scalable() {
            return Err(ClusterError::Malformed {
                kind: workload.kind.to_string(),
                name: workload.name.clone(),
                reason: "daemon-sets cannot be scaled".into(),
            });
        }
        self.scale_calls
            .lock()
            .unwrap()
            .push((workload.clone(), replicas));
        self.scaled_at
            .lock()
            .unwrap()
            .entry(workload.name.clone())
            .or_insert_with(|| self.created.elapsed());

        let mut workloads = self.workloads.lock().unwrap();
        let entry = workloads
            .iter_mut()
            .find(|w| w.reference == *workload)
            .ok_or_else(|| ClusterError::Config(format!("{workload} not found")))?;
        entry.replicas = replicas;

        let stuck = self.stuck.lock().unwrap().contains(&workload.name);
        let mut pods = self.pods.lock().unwrap();
        if replicas == 0 && !stuck {
            pods.retain(|p| p.owner.as_ref() != Some(workload));
        } else if replicas > 0 {
            pods.retain(|p| p.owner.as_ref() != Some(workload));
            pods.extend(pods_for(entry, replicas));
        }
        Ok(())
    }

    async fn storage_engine_state(&self, volume: &str) -> Result<Option<String>, ClusterError> {
        self.check_api()?;
        let Some(pv) = self.volumes.iter().find(|v| v.name == volume) else {
            return Ok(None);
        };
        let used = pv.claim.as_ref().is_some_and(|(namespace, claim)| {
            self.pods.lock().unwrap().iter().any(|p| {
                p.namespace == *namespace && p.phase.is_active() && p.references_claim(claim)
            })
        });
        let attached = used || self.held.lock().unwrap().contains(volume);
        Ok(Some(if attached { "attached" } else { "detached" }.into()))
    }

    async fn can_i(&self, check: &AccessCheck) -> Result<bool, ClusterError> {
        self.check_api()?;
        Ok(!self.denied.lock().unwrap().contains(&check.to_string()))
    }
}

pub fn statefulset(namespace: &str, name: &str, replicas: i32, template: &str) -> Workload {
    Workload {
        reference: WorkloadRef {
            kind: WorkloadKind::StatefulSet,
            namespace: namespace.into(),
            name: name.into(),
        },
        replicas,
        template_claims: vec![],
        claim_templates: vec![template.into()],
    }
}

pub fn daemonset(namespace: &str, name: &str, claim: &str) -> Workload {
    Workload {
        reference: WorkloadRef {
            kind: WorkloadKind::DaemonSet,
            namespace: namespace.into(),
            name: name.into(),
        },
        replicas: 1,
        template_claims: vec![claim.into()],
        claim_templates: vec![],
    }
}

pub fn bound_volume(name: &str, class: &str, namespace: &str, claim: &str) -> PersistentVolumeInfo {
    PersistentVolumeInfo {
        name: name.into(),
        storage_class: Some(class.into()),
        claim: Some((namespace.into(), claim.into())),
        phase: "Bound".into(),
    }
}

// =============================================================================
// Controllers
// =============================================================================

/// GitOps applications held in memory.
pub struct FakeController {
    states: Mutex<BTreeMap<String, ControllerState>>,
    pub pause_calls: AtomicUsize,
    pub restore_calls: AtomicUsize,
}

impl FakeController {
    pub fn new(states: Vec<(&str, ControllerState)>) -> Self {
        Self {
            states: Mutex::new(
                states
                    .into_iter()
                    .map(|(name, state)| (name.to_string(), state))
                    .collect(),
            ),
            pause_calls: AtomicUsize::new(0),
            restore_calls: AtomicUsize::new(0),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, ControllerState> {
        self.states.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReconcilingController for FakeController {
    fn kind(&self) -> ControllerKind {
        ControllerKind::GitOpsApp
    }

    async fn enumerate(&self) -> Result<Vec<ControllerId>, ClusterError> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .keys()
            .map(|name| ControllerId {
                kind: ControllerKind::GitOpsApp,
                namespace: Some("argocd".into()),
                name: name.clone(),
            })
            .collect())
    }

    async fn read_state(&self, id: &ControllerId) -> Result<ControllerState, ClusterError> {
        self.states
            .lock()
            .unwrap()
            .get(&id.name)
            .cloned()
            .ok_or_else(|| ClusterError::Config(format!("{id} not found")))
    }

    async fn pause(&self, id: &ControllerId) -> Result<(), ClusterError> {
        self.pause_calls.fetch_add(1, Ordering::SeqCst);
        self.states
            .lock()
            .unwrap()
            .insert(id.name.clone(), ControllerState::AutoSync { policy: None });
        Ok(())
    }

    async fn restore(&self, id: &ControllerId, saved: &ControllerState) -> Result<(), ClusterError> {
        self.restore_calls.fetch_add(1, Ordering::SeqCst);
        self.states
            .lock()
            .unwrap()
            .insert(id.name.clone(), saved.clone());
        Ok(())
    }
}

// =============================================================================
// Fixture
// =============================================================================

pub const MASTERS: [u32; 3] = [100, 101, 102];
pub const WORKERS: [u32; 4] = [200, 201, 202, 203];

/// Three masters, four workers, one single-replica stateful-set on Longhorn.
pub struct Fixture {
    pub hypervisor: Arc<FakeHypervisor>,
    pub cluster: Arc<FakeCluster>,
    pub controller: Arc<FakeController>,
}

impl Fixture {
    pub fn standard() -> Self {
        Self::with_workloads(
            vec![
                bound_volume("pvc-1", "longhorn", "db", "data-pg-0"),
                bound_volume("pvc-local", "local-path", "db", "scratch"),
            ],
            vec![statefulset("db", "pg", 1, "data")],
        )
    }

    pub fn with_workloads(volumes: Vec<PersistentVolumeInfo>, workloads: Vec<Workload>) -> Self {
        let mut records = Vec::new();
        for (order, id) in MASTERS.iter().enumerate() {
            records.push(vm_record(*id, "master", order as u32, PowerState::Running));
        }
        for (order, id) in WORKERS.iter().enumerate() {
            records.push(vm_record(*id, "worker", order as u32, PowerState::Running));
        }

        Self {
            hypervisor: Arc::new(FakeHypervisor::new(records)),
            cluster: Arc::new(FakeCluster::new(volumes, workloads)),
            controller: Arc::new(FakeController::new(vec![
                (
                    "platform",
                    ControllerState::AutoSync {
                        policy: Some(json!({"prune": true, "selfHeal": true})),
                    },
                ),
                ("manual", ControllerState::AutoSync { policy: None }),
            ])),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            hypervisor: self.hypervisor.clone(),
            cluster: self.cluster.clone(),
            controllers: vec![self.controller.clone() as Arc<dyn ReconcilingController>],
        }
    }

    pub fn orchestrator(
        &self,
        config: &LifecycleConfig,
        direction: Direction,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Orchestrator {
        let checkpoint = checkpoint(config, direction, options.dry_run);
        Orchestrator::new(self.backends(), config.clone(), options, checkpoint, cancel).unwrap()
    }
}

/// Short waits; checkpoint persisted only when `state_dir` is given.
pub fn config(state_dir: Option<&Path>) -> LifecycleConfig {
    let mut config = LifecycleConfig::default();
    config.timing.poll_interval_secs = 5;
    config.timing.drain_max_wait_secs = 60;
    config.timing.power_max_wait_secs = Some(120);
    config.timing.api_ready_max_wait_secs = 120;
    config.checkpoint.enabled = state_dir.is_some();
    config.checkpoint.state_dir = state_dir.map(Path::to_path_buf);
    config
}

pub fn checkpoint(config: &LifecycleConfig, direction: Direction, dry_run: bool) -> RunCheckpoint {
    open_checkpoint(&config.checkpoint, direction, dry_run).unwrap()
}

pub fn quiet() -> RunOptions {
    RunOptions {
        quiet: true,
        ..RunOptions::default()
    }
}
