//! Run state machine and checkpoint persistence.
//!
//! The checkpoint records everything a later run needs to undo this one:
//! original replica counts of drained workloads and the saved state of every
//! paused controller. It is written before each mutating phase, so an
//! interrupted run can be resumed or reverted from it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::controllers::PauseLedger;
use crate::drain::DrainTarget;
use crate::error::LifecycleError;
use crate::model::WorkloadRef;

/// Phases of a lifecycle run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Not yet started.
    Idle,
    /// Checking both control planes and resolving inventory.
    Preflight,
    /// Reconciling controllers are paused.
    ControllersPaused,
    /// Scaling storage-backed workloads to zero.
    Draining,
    /// Volume release has been checked.
    DrainVerified,
    /// Powering role groups off or on.
    VmsTransitioning,
    /// Waiting for the cluster API and nodes after power-on.
    AwaitingCluster,
    /// Scaling workloads back and resuming controllers.
    Restoring,
    /// Run finished.
    Done,
    /// Run stopped early.
    Aborted,
}

impl RunState {
    /// Human-readable description of the state.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Preflight => "Running preflight checks",
            Self::ControllersPaused => "Controllers paused",
            Self::Draining => "Draining storage workloads",
            Self::DrainVerified => "Drain verified",
            Self::VmsTransitioning => "Transitioning VM power",
            Self::AwaitingCluster => "Waiting for the cluster",
            Self::Restoring => "Restoring workloads and controllers",
            Self::Done => "Done",
            Self::Aborted => "Aborted",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Which way the cluster is being taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Shutdown,
    Start,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shutdown => write!(f, "shutdown"),
            Self::Start => write!(f, "start"),
        }
    }
}

/// A workload scaled down by a shutdown, with the count to restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaledWorkload {
    pub workload: WorkloadRef,
    pub original_replicas: i32,
    #[serde(default)]
    pub restored: bool,
}

/// Persisted record of an in-flight or interrupted run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCheckpoint {
    /// Where this checkpoint is written; `None` keeps it in memory only.
    #[serde(skip)]
    path: Option<PathBuf>,
    /// Direction of the run that last wrote the checkpoint.
    pub direction: Direction,
    /// Last state reached.
    pub state: RunState,
    /// Workloads scaled down, in the order they were recorded.
    #[serde(default)]
    pub scaled: Vec<ScaledWorkload>,
    /// Saved controller states.
    #[serde(default)]
    pub controllers: PauseLedger,
    /// Timestamp of last update.
    pub updated_at: String,
    /// Last error message (if any).
    pub last_error: Option<String>,
}

impl RunCheckpoint {
    /// A fresh checkpoint written under `dir`.
    #[must_use]
    pub fn new(dir: &Path, direction: Direction) -> Self {
        Self {
            path: Some(Self::file(dir)),
            ..Self::in_memory(direction)
        }
    }

    /// A checkpoint that is never written.
    #[must_use]
    pub fn in_memory(direction: Direction) -> Self {
        Self {
            path: None,
            direction,
            state: RunState::Idle,
            scaled: Vec::new(),
            controllers: PauseLedger::default(),
            updated_at: chrono::Utc::now().to_rfc3339(),
            last_error: None,
        }
    }

    /// Checkpoint file path for a state directory.
    #[must_use]
    pub fn file(dir: &Path) -> PathBuf {
        dir.join("checkpoint.json")
    }

    /// Load the checkpoint under `dir` if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(dir: &Path) -> Result<Option<Self>, LifecycleError> {
        let path = Self::file(dir);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path).map_err(|e| {
            LifecycleError::Checkpoint(format!("Failed to read {}: {e}", path.display()))
        })?;
        let mut checkpoint: Self = serde_json::from_str(&content).map_err(|e| {
            LifecycleError::Checkpoint(format!("Failed to parse {}: {e}", path.display()))
        })?;
        checkpoint.path = Some(path);

        info!(
            direction = %checkpoint.direction,
            state = ?checkpoint.state,
            workloads = checkpoint.pending_workloads().count(),
            controllers = checkpoint.controllers.pending(),
            "Loaded run checkpoint"
        );
        Ok(Some(checkpoint))
    }

    /// Stop writing this checkpoint to disk. Used for dry runs.
    pub fn detach(&mut self) {
        self.path = None;
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the checkpoint to disk, if it has a path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&mut self) -> Result<(), LifecycleError> {
        self.updated_at = chrono::Utc::now().to_rfc3339();
        let Some(ref path) = self.path else {
            return Ok(());
        };

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                LifecycleError::Checkpoint(format!("Failed to create {}: {e}", dir.display()))
            })?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| LifecycleError::Checkpoint(format!("Failed to serialize: {e}")))?;
        std::fs::write(path, content).map_err(|e| {
            LifecycleError::Checkpoint(format!("Failed to write {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "Saved run checkpoint");
        Ok(())
    }

    /// Remove the checkpoint file and stop persisting. Later state changes
    /// in the same run stay in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn clear(&mut self) -> Result<(), LifecycleError> {
        let Some(path) = self.path.take() else {
            return Ok(());
        };
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "Removed run checkpoint");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                self.path = Some(path.clone());
                Err(LifecycleError::Checkpoint(format!(
                    "Failed to remove {}: {e}",
                    path.display()
                )))
            }
        }
    }

    /// Move to `state` and save.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn set_state(&mut self, state: RunState) -> Result<(), LifecycleError> {
        debug!("Checkpoint: {} -> {}", self.state, state);
        self.state = state;
        self.save()
    }

    /// Record an error for the current state and save.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn record_error(&mut self, error: &str) -> Result<(), LifecycleError> {
        self.last_error = Some(error.to_string());
        self.save()
    }

    /// Remember the pre-drain replica count of a workload.
    ///
    /// An unrestored entry already holding this workload wins, so a second
    /// shutdown run never replaces the true original with the zero it left.
    pub fn record_scaled(&mut self, target: &DrainTarget) {
        match self.scaled.iter_mut().find(|s| s.workload == target.workload) {
            Some(entry) if !entry.restored => {}
            Some(entry) => {
                entry.original_replicas = target.replicas;
                entry.restored = false;
            }
            None => self.scaled.push(ScaledWorkload {
                workload: target.workload.clone(),
                original_replicas: target.replicas,
                restored: false,
            }),
        }
    }

    /// Original replica count recorded for `workload`.
    #[must_use]
    pub fn original_replicas(&self, workload: &WorkloadRef) -> Option<i32> {
        self.scaled
            .iter()
            .find(|s| s.workload == *workload)
            .map(|s| s.original_replicas)
    }

    pub fn pending_workloads(&self) -> impl Iterator<Item = &ScaledWorkload> {
        self.scaled.iter().filter(|s| !s.restored)
    }

    pub fn mark_restored(&mut self, workload: &WorkloadRef) {
        if let Some(entry) = self.scaled.iter_mut().find(|s| s.workload == *workload) {
            entry.restored = true;
        }
    }

    /// Nothing left to restore.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.pending_workloads().next().is_none() && self.controllers.pending() == 0
    }
}
