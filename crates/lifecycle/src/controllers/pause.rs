//! Controller-pause manager.
//!
//! The ledger is an explicit value owned by the orchestrator and persisted in
//! the run checkpoint. An entry's saved state is recorded once, before the
//! first pause, and is never overwritten while the entry is unrestored; that
//! is what makes a re-run after interruption restore the true original state.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ControllerId, ControllerState, ReconcilingController};

/// Saved pre-pause state of one controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PausedController {
    pub id: ControllerId,
    pub saved: ControllerState,
    /// Set once `saved` has been written back.
    pub restored: bool,
}

/// Every controller touched by pause, with its saved state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PauseLedger {
    entries: Vec<PausedController>,
}

impl PauseLedger {
    #[must_use]
    pub fn entries(&self) -> &[PausedController] {
        &self.entries
    }

    #[must_use]
    pub fn get(&self, id: &ControllerId) -> Option<&PausedController> {
        self.entries.iter().find(|e| e.id == *id)
    }

    /// Record `state` as the pre-pause state of `id` unless an unrestored
    /// entry already holds it.
    fn record(&mut self, id: &ControllerId, state: &ControllerState) {
        match self.entries.iter_mut().find(|e| e.id == *id) {
            Some(entry) if !entry.restored => {}
            Some(entry) => {
                entry.saved = state.clone();
                entry.restored = false;
            }
            None => self.entries.push(PausedController {
                id: id.clone(),
                saved: state.clone(),
                restored: false,
            }),
        }
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.entries.iter().filter(|e| !e.restored).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A controller operation that failed; reported, never thrown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerFailure {
    pub controller: String,
    pub error: String,
}

/// Outcome of [`PauseManager::pause_all`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PauseSummary {
    pub paused: Vec<ControllerId>,
    /// Controllers that were not reconciling before the run.
    pub already_paused: Vec<ControllerId>,
    pub failures: Vec<ControllerFailure>,
}

/// Outcome of [`PauseManager::resume_all`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeSummary {
    pub restored: Vec<ControllerId>,
    /// Controllers left for manual follow-up.
    pub failures: Vec<ControllerFailure>,
}

/// Pauses and restores every registered controller kind.
#[derive(Clone)]
pub struct PauseManager {
    controllers: Vec<Arc<dyn ReconcilingController>>,
    dry_run: bool,
}

impl PauseManager {
    #[must_use]
    pub fn new(controllers: Vec<Arc<dyn ReconcilingController>>, dry_run: bool) -> Self {
        Self {
            controllers,
            dry_run,
        }
    }

    /// Pause every controller, recording pre-pause state in `ledger`.
    ///
    /// A failure on one controller is logged and recorded; the rest are
    /// still paused.
    pub async fn pause_all(&self, ledger: &mut PauseLedger) -> PauseSummary {
        let mut summary = PauseSummary::default();

        for controller in &self.controllers {
            let kind = controller.kind();
            let ids = match controller.enumerate().await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Failed to enumerate controllers");
                    summary.failures.push(ControllerFailure {
                        controller: kind.to_string(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            info!(kind = %kind, count = ids.len(), "Pausing controllers");

            for id in ids {
                let current = match controller.read_state(&id).await {
                    Ok(state) => state,
                    Err(e) => {
                        warn!(controller = %id, error = %e, "Failed to read controller state");
                        summary.failures.push(ControllerFailure {
                            controller: id.to_string(),
                            error: e.to_string(),
                        });
                        continue;
                    }
                };

                ledger.record(&id, &current);

                if !current.is_reconciling() {
                    info!(controller = %id, "Already paused");
                    summary.already_paused.push(id);
                    continue;
                }

                if self.dry_run {
                    info!(controller = %id, "[DRY-RUN] Would pause");
                    summary.paused.push(id);
                    continue;
                }

                match controller.pause(&id).await {
                    Ok(()) => summary.paused.push(id),
                    Err(e) => {
                        warn!(controller = %id, error = %e, "Failed to pause controller");
                        summary.failures.push(ControllerFailure {
                            controller: id.to_string(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        summary
    }

    /// Restore every unrestored ledger entry to its saved state.
    ///
    /// Safe to call repeatedly: restored entries are skipped, so each saved
    /// state is written back exactly once.
    pub async fn resume_all(&self, ledger: &mut PauseLedger) -> ResumeSummary {
        let mut summary = ResumeSummary::default();

        for entry in ledger.entries.iter_mut().filter(|e| !e.restored) {
            let Some(controller) = self.controllers.iter().find(|c| c.kind() == entry.id.kind)
            else {
                warn!(controller = %entry.id, "No handler registered for controller kind");
                summary.failures.push(ControllerFailure {
                    controller: entry.id.to_string(),
                    error: format!("no handler registered for kind {}", entry.id.kind),
                });
                continue;
            };

            if self.dry_run {
                info!(controller = %entry.id, saved = ?entry.saved, "[DRY-RUN] Would restore");
                entry.restored = true;
                summary.restored.push(entry.id.clone());
                continue;
            }

            match controller.restore(&entry.id, &entry.saved).await {
                Ok(()) => {
                    entry.restored = true;
                    summary.restored.push(entry.id.clone());
                }
                Err(e) => {
                    warn!(controller = %entry.id, error = %e, "Failed to restore controller");
                    summary.failures.push(ControllerFailure {
                        controller: entry.id.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            restored = summary.restored.len(),
            failed = summary.failures.len(),
            "Controller resume finished"
        );
        summary
    }
}
