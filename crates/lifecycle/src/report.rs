//! End-of-run status report.
//!
//! Always produced, whatever the outcome. Lists every in-scope volume exactly
//! once with its release classification, every VM touched, and every
//! controller whose pause or resume failed.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::controllers::{ControllerFailure, ControllerId, PauseSummary, ResumeSummary};
use crate::drain::{DrainReport, VolumeClassification, VolumeOutcome, WorkloadOutcome};
use crate::error::LifecycleError;
use crate::model::{ManagedVm, ReleaseStatus, StorageVolume, WorkloadRef};
use crate::power::{GroupResult, VmOutcome};
use crate::state::{Direction, RunState};
use crate::ui;

/// A checkpointed workload scaled back on start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub workload: WorkloadRef,
    pub replicas: i32,
    pub error: Option<String>,
}

/// Controller pause/resume results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerReport {
    pub paused: Vec<ControllerId>,
    pub already_paused: Vec<ControllerId>,
    pub pause_failures: Vec<ControllerFailure>,
    pub restored: Vec<ControllerId>,
    /// Left for manual follow-up.
    pub resume_failures: Vec<ControllerFailure>,
    /// Ledger entries still awaiting restore when the run ended.
    pub left_paused: usize,
}

/// Volume classification totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCounts {
    pub total: usize,
    pub unused: usize,
    pub still_in_use: usize,
    pub errored: usize,
}

/// Structured run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub direction: Option<Direction>,
    pub dry_run: bool,
    pub strict: bool,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub final_state: RunState,
    /// Every state entered, in order.
    pub states: Vec<RunState>,
    /// VMs in scope with their discovered power state.
    pub inventory: Vec<ManagedVm>,
    pub vms: Vec<VmOutcome>,
    pub volumes: Vec<VolumeOutcome>,
    pub workloads: Vec<WorkloadOutcome>,
    pub restored_workloads: Vec<RestoreOutcome>,
    pub controllers: ControllerReport,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl StatusReport {
    #[must_use]
    pub fn new(direction: Option<Direction>, dry_run: bool, strict: bool) -> Self {
        Self {
            direction,
            dry_run,
            strict,
            started_at: chrono::Utc::now().to_rfc3339(),
            finished_at: None,
            final_state: RunState::Idle,
            states: vec![RunState::Idle],
            inventory: Vec::new(),
            vms: Vec::new(),
            volumes: Vec::new(),
            workloads: Vec::new(),
            restored_workloads: Vec::new(),
            controllers: ControllerReport::default(),
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub(crate) fn enter(&mut self, state: RunState) {
        self.final_state = state;
        self.states.push(state);
    }

    pub(crate) fn finish(&mut self) {
        self.finished_at = Some(chrono::Utc::now().to_rfc3339());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub(crate) fn record_pause(&mut self, summary: PauseSummary) {
        for failure in &summary.failures {
            self.warn(
                LifecycleError::Pause {
                    controller: failure.controller.clone(),
                    message: failure.error.clone(),
                }
                .to_string(),
            );
        }
        self.controllers.paused.extend(summary.paused);
        self.controllers.already_paused.extend(summary.already_paused);
        self.controllers.pause_failures.extend(summary.failures);
    }

    pub(crate) fn record_resume(&mut self, summary: ResumeSummary, left_paused: usize) {
        self.controllers.restored.extend(summary.restored);
        self.controllers.resume_failures.extend(summary.failures);
        self.controllers.left_paused = left_paused;
    }

    pub(crate) fn record_drain(&mut self, drain: DrainReport) {
        for warning in drain.warnings() {
            self.warnings.push(warning.to_string());
        }
        for volume in drain.volumes.iter().filter(|v| v.classification != VolumeClassification::Unused) {
            let message = match volume.classification {
                VolumeClassification::StillInUse => format!(
                    "volume {} still in use by {}",
                    volume.volume,
                    volume.active_pods.join(", ")
                ),
                _ => format!(
                    "volume {} errored: {}",
                    volume.volume,
                    volume.error.as_deref().unwrap_or("unknown error")
                ),
            };
            self.warnings.push(message);
        }
        self.volumes.extend(drain.volumes);
        self.workloads.extend(drain.workloads);
    }

    pub(crate) fn record_group(&mut self, group: GroupResult) {
        for failure in group.failures() {
            if let Some(ref e) = failure.error {
                self.errors.push(e.clone());
            }
        }
        self.vms.extend(group.outcomes);
    }

    /// Classify discovered volumes without draining, for read-only status.
    pub(crate) fn record_volume_status(&mut self, volumes: &[StorageVolume]) {
        self.volumes.extend(volumes.iter().map(|v| VolumeOutcome {
            volume: v.name.clone(),
            claim: v.claim.as_ref().map(ToString::to_string),
            classification: match v.status {
                ReleaseStatus::BoundInUse => VolumeClassification::StillInUse,
                ReleaseStatus::BoundUnused | ReleaseStatus::Available => {
                    VolumeClassification::Unused
                }
            },
            owners: vec![],
            active_pods: vec![],
            engine_state: None,
            notes: vec![],
            error: None,
        }));
    }

    #[must_use]
    pub fn volume_counts(&self) -> VolumeCounts {
        let count = |class: VolumeClassification| {
            self.volumes
                .iter()
                .filter(|v| v.classification == class)
                .count()
        };
        VolumeCounts {
            total: self.volumes.len(),
            unused: count(VolumeClassification::Unused),
            still_in_use: count(VolumeClassification::StillInUse),
            errored: count(VolumeClassification::Errored),
        }
    }

    /// Process exit code: 0 when done (warnings allowed), 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(self.final_state != RunState::Done)
    }

    /// Pretty JSON rendering.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write the JSON report to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_json(&self, path: &Path) -> Result<(), LifecycleError> {
        let json = self
            .to_json()
            .map_err(|e| LifecycleError::Checkpoint(format!("Failed to serialize report: {e}")))?;
        std::fs::write(path, json).map_err(|e| {
            LifecycleError::Checkpoint(format!("Failed to write {}: {e}", path.display()))
        })
    }

    /// Print the human-readable summary.
    pub fn print(&self) {
        ui::print_section("Status report");

        if let Some(direction) = self.direction {
            ui::print_kv("Operation", &direction.to_string());
        }
        ui::print_kv("Final state", self.final_state.description());
        if self.dry_run {
            ui::print_kv("Mode", "dry run");
        } else if self.strict {
            ui::print_kv("Mode", "strict");
        }

        if !self.inventory.is_empty() {
            println!();
            ui::print_info("Virtual machines");
            for vm in &self.inventory {
                ui::print_list_item(&format!("{vm} [{}] on {}: {}", vm.role, vm.node, vm.power));
            }
        }

        if !self.vms.is_empty() {
            println!();
            ui::print_info("Power transitions");
            for vm in &self.vms {
                let name = format!("{} ({}) -> {}", vm.name, vm.id, vm.target);
                ui::print_check_result(&name, !vm.failed(), vm.error.as_deref());
            }
        }

        let counts = self.volume_counts();
        println!();
        ui::print_info(&format!(
            "Volumes: {} total, {} unused, {} still in use, {} errored",
            counts.total, counts.unused, counts.still_in_use, counts.errored
        ));
        for volume in &self.volumes {
            let label = match volume.claim {
                Some(ref claim) => format!("{} ({claim})", volume.volume),
                None => volume.volume.clone(),
            };
            let detail = match volume.classification {
                VolumeClassification::Unused => None,
                VolumeClassification::StillInUse => Some(format!(
                    "still in use by {}",
                    volume.active_pods.join(", ")
                )),
                VolumeClassification::Errored => volume.error.clone(),
            };
            ui::print_check_result(
                &label,
                volume.classification == VolumeClassification::Unused,
                detail.as_deref(),
            );
        }

        if !self.restored_workloads.is_empty() {
            println!();
            ui::print_info("Restored workloads");
            for restored in &self.restored_workloads {
                let name = format!("{} -> {} replicas", restored.workload, restored.replicas);
                ui::print_check_result(&name, restored.error.is_none(), restored.error.as_deref());
            }
        }

        let c = &self.controllers;
        println!();
        ui::print_info(&format!(
            "Controllers: {} paused, {} already paused, {} restored, {} left paused",
            c.paused.len(),
            c.already_paused.len(),
            c.restored.len(),
            c.left_paused
        ));
        for failure in &c.pause_failures {
            ui::print_warning(&format!("pause failed: {} ({})", failure.controller, failure.error));
        }
        for failure in &c.resume_failures {
            ui::print_error(&format!(
                "resume failed, manual follow-up needed: {} ({})",
                failure.controller, failure.error
            ));
        }

        if !self.warnings.is_empty() {
            println!();
            for warning in &self.warnings {
                ui::print_warning(warning);
            }
        }
        if !self.errors.is_empty() {
            println!();
            for error in &self.errors {
                ui::print_error(error);
            }
        }

        println!();
        match self.final_state {
            RunState::Done if self.warnings.is_empty() => ui::print_success("Completed"),
            RunState::Done => ui::print_warning("Completed with warnings"),
            _ => ui::print_error("Aborted"),
        }
    }
}
