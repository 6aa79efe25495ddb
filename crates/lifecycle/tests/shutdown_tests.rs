//! Shutdown runs against in-memory control planes.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cluster_lifecycle::drain::{VolumeClassification, WorkloadAction};
use cluster_lifecycle::hypervisor::VmRecord;
use cluster_lifecycle::model::{PowerState, RoleFilter, Workload, WorkloadKind, WorkloadRef};
use cluster_lifecycle::orchestrator::RunOptions;
use cluster_lifecycle::state::{Direction, RunCheckpoint, RunState};

use common::{bound_volume, config, daemonset, quiet, statefulset, Event, Fixture, MASTERS, WORKERS};

fn position(events: &[Event], wanted: impl Fn(&Event) -> bool) -> Vec<usize> {
    events
        .iter()
        .enumerate()
        .filter(|(_, e)| wanted(e))
        .map(|(i, _)| i)
        .collect()
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_then_stops_workers_before_masters() {
    let dir = tempfile::tempdir().unwrap();
    let fx = Fixture::standard();
    let before = fx.controller.snapshot();

    let report = fx
        .orchestrator(&config(Some(dir.path())), Direction::Shutdown, quiet(), CancellationToken::new())
        .shutdown()
        .await;

    assert_eq!(report.final_state, RunState::Done);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(
        report.states,
        vec![
            RunState::Idle,
            RunState::Preflight,
            RunState::ControllersPaused,
            RunState::Draining,
            RunState::DrainVerified,
            RunState::VmsTransitioning,
            RunState::Done,
        ]
    );

    // Only the Longhorn volume is in scope, and it was released.
    let counts = report.volume_counts();
    assert_eq!(counts.total, 1);
    assert_eq!(counts.unused, 1);
    assert_eq!(counts.still_in_use, 0);
    assert_eq!(report.volumes[0].volume, "pvc-1");
    assert_eq!(report.volumes[0].engine_state.as_deref(), Some("detached"));
    assert_eq!(fx.cluster.replicas("pg"), Some(0));
    assert_eq!(fx.cluster.active_pods("db"), 0);

    // Controllers paused and left paused for the next start.
    assert_eq!(report.controllers.paused.len(), 1);
    assert_eq!(report.controllers.already_paused.len(), 1);
    assert_eq!(report.controllers.left_paused, 2);
    assert_ne!(fx.controller.snapshot(), before);

    for id in MASTERS.iter().chain(WORKERS.iter()) {
        assert_eq!(fx.hypervisor.power(*id), PowerState::Stopped);
    }

    let events = fx.hypervisor.events();
    let worker_requests = position(&events, |e| matches!(e, Event::ShutdownRequested(id) if WORKERS.contains(id)));
    let master_requests = position(&events, |e| matches!(e, Event::ShutdownRequested(id) if MASTERS.contains(id)));
    let workers_stopped = position(&events, |e| matches!(e, Event::Reached(id, PowerState::Stopped) if WORKERS.contains(id)));
    assert_eq!(worker_requests.len(), 4);
    assert_eq!(master_requests.len(), 3);
    assert!(worker_requests.iter().max() < master_requests.iter().min());
    assert!(workers_stopped.iter().max() < master_requests.iter().min());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_without_checkpoint_resumes_controllers() {
    let fx = Fixture::standard();
    let before = fx.controller.snapshot();

    let report = fx
        .orchestrator(&config(None), Direction::Shutdown, quiet(), CancellationToken::new())
        .shutdown()
        .await;

    assert_eq!(report.final_state, RunState::Done);
    assert_eq!(report.controllers.paused.len(), 1);
    assert_eq!(report.controllers.left_paused, 0);
    assert_eq!(fx.controller.snapshot(), before);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("1 drained workload(s) will not be restored")));
    for id in MASTERS.iter().chain(WORKERS.iter()) {
        assert_eq!(fx.hypervisor.power(*id), PowerState::Stopped);
    }

    // A later start has nothing to restore and leaves the controllers as they were.
    let report = fx
        .orchestrator(&config(None), Direction::Start, quiet(), CancellationToken::new())
        .start()
        .await;
    assert_eq!(report.final_state, RunState::Done);
    assert_eq!(fx.controller.snapshot(), before);
}

#[tokio::test(start_paused = true)]
async fn test_second_shutdown_has_no_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(Some(dir.path()));
    let fx = Fixture::standard();

    let first = fx
        .orchestrator(&config, Direction::Shutdown, quiet(), CancellationToken::new())
        .shutdown()
        .await;
    assert_eq!(first.final_state, RunState::Done);

    let events = fx.hypervisor.events();
    let scales = fx.cluster.scale_calls();
    let controllers = fx.controller.snapshot();

    let second = fx
        .orchestrator(&config, Direction::Shutdown, quiet(), CancellationToken::new())
        .shutdown()
        .await;

    assert_eq!(second.final_state, RunState::Done);
    assert_eq!(fx.hypervisor.events(), events);
    assert_eq!(fx.cluster.scale_calls(), scales);
    assert_eq!(fx.controller.snapshot(), controllers);
    assert_eq!(fx.controller.pause_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(second
        .workloads
        .iter()
        .all(|w| w.action == WorkloadAction::AlreadyZero));
    assert!(second.controllers.paused.is_empty());

    // The original counts survive the second run.
    let checkpoint = RunCheckpoint::load(dir.path()).unwrap().unwrap();
    let pg = WorkloadRef {
        kind: WorkloadKind::StatefulSet,
        namespace: "db".into(),
        name: "pg".into(),
    };
    assert_eq!(checkpoint.original_replicas(&pg), Some(1));
    assert_eq!(checkpoint.controllers.pending(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_role_filter_limits_transition() {
    let fx = Fixture::standard();
    let options = RunOptions {
        roles: RoleFilter::Worker,
        ..quiet()
    };

    let report = fx
        .orchestrator(&config(None), Direction::Shutdown, options, CancellationToken::new())
        .shutdown()
        .await;

    assert_eq!(report.final_state, RunState::Done);
    assert_eq!(report.vms.len(), 4);
    for id in MASTERS {
        assert_eq!(fx.hypervisor.power(id), PowerState::Running);
    }
}

// =============================================================================
// Stuck pods
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_stuck_pod_warns_but_proceeds_by_default() {
    let fx = Fixture::standard();
    fx.cluster.stick("pg");

    let report = fx
        .orchestrator(&config(None), Direction::Shutdown, quiet(), CancellationToken::new())
        .shutdown()
        .await;

    assert_eq!(report.final_state, RunState::Done);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.volume_counts().still_in_use, 1);
    assert_eq!(report.volumes[0].classification, VolumeClassification::StillInUse);
    assert_eq!(report.volumes[0].active_pods, vec!["db/pg-0".to_string()]);
    assert!(report.warnings.iter().any(|w| w.contains("still active after 60s")));
    assert_eq!(fx.hypervisor.requests().len(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_pod_aborts_in_strict_mode() {
    let fx = Fixture::standard();
    fx.cluster.stick("pg");
    let before = fx.controller.snapshot();
    let options = RunOptions {
        strict: true,
        ..quiet()
    };

    let report = fx
        .orchestrator(&config(None), Direction::Shutdown, options, CancellationToken::new())
        .shutdown()
        .await;

    assert_eq!(report.final_state, RunState::Aborted);
    assert_ne!(report.exit_code(), 0);
    assert!(!report.states.contains(&RunState::VmsTransitioning));
    assert!(fx.hypervisor.requests().is_empty());
    assert_eq!(fx.controller.snapshot(), before);
    assert_eq!(report.controllers.left_paused, 0);
}

#[tokio::test(start_paused = true)]
async fn test_volume_held_by_storage_engine_counts_as_in_use() {
    let fx = Fixture::standard();
    fx.cluster.hold_attached("pvc-1");

    let report = fx
        .orchestrator(&config(None), Direction::Shutdown, quiet(), CancellationToken::new())
        .shutdown()
        .await;

    assert_eq!(report.final_state, RunState::Done);
    assert_eq!(fx.cluster.active_pods("db"), 0);
    let volume = &report.volumes[0];
    assert_eq!(volume.classification, VolumeClassification::StillInUse);
    assert!(volume.active_pods.is_empty());
    assert_eq!(volume.engine_state.as_deref(), Some("attached"));
    assert!(volume
        .notes
        .iter()
        .any(|n| n.contains("still reports pvc-1 attached after 60s")));

    let strict = Fixture::standard();
    strict.cluster.hold_attached("pvc-1");
    let options = RunOptions {
        strict: true,
        ..quiet()
    };
    let report = strict
        .orchestrator(&config(None), Direction::Shutdown, options, CancellationToken::new())
        .shutdown()
        .await;

    assert_eq!(report.final_state, RunState::Aborted);
    assert!(strict.hypervisor.requests().is_empty());
}

// =============================================================================
// Abort paths
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_preflight_failure_touches_nothing() {
    let fx = Fixture::standard();
    fx.hypervisor
        .ping_fails
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let report = fx
        .orchestrator(&config(None), Direction::Shutdown, quiet(), CancellationToken::new())
        .shutdown()
        .await;

    assert_eq!(report.final_state, RunState::Aborted);
    assert_eq!(report.states, vec![RunState::Idle, RunState::Preflight, RunState::Aborted]);
    assert!(report.errors[0].contains("Discovery failed"));
    assert_eq!(fx.controller.pause_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(fx.controller.restore_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(fx.cluster.scale_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_permission_aborts_before_pausing() {
    let fx = Fixture::standard();
    fx.cluster.deny("patch statefulsets.apps");

    let report = fx
        .orchestrator(&config(None), Direction::Shutdown, quiet(), CancellationToken::new())
        .shutdown()
        .await;

    assert_eq!(report.final_state, RunState::Aborted);
    assert_eq!(report.states, vec![RunState::Idle, RunState::Preflight, RunState::Aborted]);
    assert!(report
        .errors
        .iter()
        .any(|e| e.contains("missing permissions: patch statefulsets.apps")));
    assert_eq!(fx.controller.pause_calls.load(Ordering::SeqCst), 0);
    assert!(fx.cluster.scale_calls().is_empty());
    assert!(fx.hypervisor.requests().is_empty());

    // Dry runs report the gap without aborting.
    let options = RunOptions {
        dry_run: true,
        ..quiet()
    };
    let report = fx
        .orchestrator(&config(None), Direction::Shutdown, options, CancellationToken::new())
        .shutdown()
        .await;
    assert_eq!(report.final_state, RunState::Done);
    assert!(report.warnings.iter().any(|w| w.contains("would abort")));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_resumes_controllers() {
    let fx = Fixture::standard();
    fx.cluster.stick("pg");
    let before = fx.controller.snapshot();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(12)).await;
        trigger.cancel();
    });

    let report = fx
        .orchestrator(&config(None), Direction::Shutdown, quiet(), cancel)
        .shutdown()
        .await;

    assert_eq!(report.final_state, RunState::Aborted);
    assert!(report.errors.iter().any(|e| e == "Run cancelled"));
    assert!(fx.hypervisor.requests().is_empty());
    assert_eq!(fx.controller.snapshot(), before);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_worker_blocks_master_shutdown() {
    let fx = Fixture::standard();
    fx.hypervisor.stick(201);
    let before = fx.controller.snapshot();

    let report = fx
        .orchestrator(&config(None), Direction::Shutdown, quiet(), CancellationToken::new())
        .shutdown()
        .await;

    assert_eq!(report.final_state, RunState::Aborted);
    assert!(report.errors.iter().any(|e| e.contains("(201)")));
    // The other workers still finished their own wait.
    for id in [200, 202, 203] {
        assert_eq!(fx.hypervisor.power(id), PowerState::Stopped);
    }
    assert!(!fx
        .hypervisor
        .requests()
        .iter()
        .any(|e| matches!(e, Event::ShutdownRequested(id) if MASTERS.contains(id))));
    assert_eq!(fx.controller.snapshot(), before);
}

// =============================================================================
// Scope rules
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_daemonsets_and_infra_workloads_are_never_scaled() {
    let coredns = Workload {
        reference: WorkloadRef {
            kind: WorkloadKind::Deployment,
            namespace: "kube-system".into(),
            name: "coredns".into(),
        },
        replicas: 2,
        template_claims: vec!["coredns-cache".into()],
        claim_templates: vec![],
    };
    let traefik = Workload {
        reference: WorkloadRef {
            kind: WorkloadKind::Deployment,
            namespace: "kube-system".into(),
            name: "traefik".into(),
        },
        replicas: 1,
        template_claims: vec!["traefik-acme".into()],
        claim_templates: vec![],
    };
    let fx = Fixture::with_workloads(
        vec![
            bound_volume("pvc-1", "longhorn", "db", "data-pg-0"),
            bound_volume("pvc-logs", "longhorn", "monitoring", "logs"),
            bound_volume("pvc-dns", "longhorn", "kube-system", "coredns-cache"),
            bound_volume("pvc-acme", "longhorn", "kube-system", "traefik-acme"),
        ],
        vec![
            statefulset("db", "pg", 1, "data"),
            daemonset("monitoring", "log-agent", "logs"),
            coredns,
            traefik,
        ],
    );

    let report = fx
        .orchestrator(&config(None), Direction::Shutdown, quiet(), CancellationToken::new())
        .shutdown()
        .await;

    assert_eq!(report.final_state, RunState::Done);
    let scaled: Vec<String> = fx
        .cluster
        .scale_calls()
        .into_iter()
        .map(|(w, _)| w.name)
        .collect();
    assert_eq!(scaled.len(), 2);
    assert!(scaled.contains(&"pg".to_string()));
    assert!(scaled.contains(&"traefik".to_string()));
    assert_eq!(fx.cluster.replicas("log-agent"), Some(1));
    assert_eq!(fx.cluster.replicas("coredns"), Some(2));

    // Every volume is reported exactly once.
    let counts = report.volume_counts();
    assert_eq!(counts.total, 4);
    assert_eq!(counts.unused + counts.still_in_use + counts.errored, 4);
    assert_eq!(counts.still_in_use, 2);
    let logs = report.volumes.iter().find(|v| v.volume == "pvc-logs").unwrap();
    assert!(logs.notes.iter().any(|n| n.contains("daemon-sets are never scaled")));
}

#[tokio::test(start_paused = true)]
async fn test_slow_namespace_does_not_hold_back_others() {
    let fx = Fixture::with_workloads(
        vec![
            bound_volume("pvc-a", "longhorn", "analytics", "data-warehouse-0"),
            bound_volume("pvc-w", "longhorn", "web", "data-cache-0"),
        ],
        vec![
            statefulset("analytics", "warehouse", 1, "data"),
            statefulset("web", "cache", 1, "data"),
        ],
    );
    fx.cluster.stick("warehouse");
    let mut config = config(None);
    config.timing.drain_parallelism = 1;

    let report = fx
        .orchestrator(&config, Direction::Shutdown, quiet(), CancellationToken::new())
        .shutdown()
        .await;

    assert_eq!(report.final_state, RunState::Done);
    // The web namespace was scaled while analytics was still waiting on its pod.
    let cache = fx.cluster.scaled_at("cache").unwrap();
    assert!(cache < Duration::from_secs(5), "cache scaled after {cache:?}");
    let counts = report.volume_counts();
    assert_eq!(counts.unused, 1);
    assert_eq!(counts.still_in_use, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unmanaged_vm_config_is_never_read() {
    let fx = Fixture::standard();
    fx.hypervisor.add(
        VmRecord {
            id: 300,
            name: "dns".into(),
            node: "pve1".into(),
            tags: vec!["k8s".into(), "dns".into()],
            power: PowerState::Running,
        },
        None,
        true,
    );

    let report = fx
        .orchestrator(&config(None), Direction::Shutdown, quiet(), CancellationToken::new())
        .shutdown()
        .await;

    assert_eq!(report.final_state, RunState::Done);
    assert_eq!(report.inventory.len(), 7);
    assert!(!fx.hypervisor.config_reads().contains(&300));
    assert_eq!(fx.hypervisor.config_reads().len(), 7);
    assert_eq!(fx.hypervisor.power(300), PowerState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let fx = Fixture::standard();
    let before = fx.controller.snapshot();
    let options = RunOptions {
        dry_run: true,
        strict: true,
        ..quiet()
    };

    let report = fx
        .orchestrator(&config(Some(dir.path())), Direction::Shutdown, options, CancellationToken::new())
        .shutdown()
        .await;

    assert_eq!(report.final_state, RunState::Done);
    assert!(fx.cluster.scale_calls().is_empty());
    assert!(fx.hypervisor.requests().is_empty());
    assert_eq!(fx.controller.snapshot(), before);
    assert_eq!(fx.controller.pause_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(!RunCheckpoint::file(dir.path()).exists());
    assert!(report
        .workloads
        .iter()
        .all(|w| w.action == WorkloadAction::WouldScale));
}
