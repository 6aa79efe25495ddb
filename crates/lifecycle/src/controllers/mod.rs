//! Reconciling controllers (GitOps applications, operator custom resources).
//!
//! Each controller kind implements [`ReconcilingController`]; the
//! [`PauseManager`] only talks to that trait, so new GitOps tools or operator
//! CRDs are added by implementing it.

mod argocd;
mod operator;
mod pause;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cluster::ClusterError;

pub use argocd::ArgoApplications;
pub use operator::OperatorResources;
pub use pause::{
    ControllerFailure, PauseLedger, PauseManager, PauseSummary, PausedController, ResumeSummary,
};

/// Closed set of controller kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "kind", rename_all = "snake_case")]
pub enum ControllerKind {
    /// A GitOps application (ArgoCD `Application`).
    GitOpsApp,
    /// An operator-managed custom resource of the named kind.
    OperatorCr(String),
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GitOpsApp => write!(f, "Application"),
            Self::OperatorCr(kind) => write!(f, "{kind}"),
        }
    }
}

/// Identity of one controller instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControllerId {
    pub kind: ControllerKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{ns}/{}", self.kind, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Self-heal or replica configuration of a controller, as found or as saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerState {
    /// Automated sync policy; `None` when syncing is manual.
    AutoSync { policy: Option<Value> },
    /// Replica-style field; `0` means paused.
    Replicas { count: Option<i64> },
    /// Pause flag; `true` means paused.
    Flag { paused: Option<bool> },
}

impl ControllerState {
    /// Whether the controller is actively reconciling in this state.
    #[must_use]
    pub fn is_reconciling(&self) -> bool {
        match self {
            Self::AutoSync { policy } => policy.as_ref().is_some_and(|p| !p.is_null()),
            Self::Replicas { count } => *count != Some(0),
            Self::Flag { paused } => *paused != Some(true),
        }
    }
}

/// Capability set every controller kind provides.
#[async_trait]
pub trait ReconcilingController: Send + Sync {
    /// Kind handled by this implementation.
    fn kind(&self) -> ControllerKind;

    /// Every instance of this kind.
    async fn enumerate(&self) -> Result<Vec<ControllerId>, ClusterError>;

    /// Current configuration of one instance.
    async fn read_state(&self, id: &ControllerId) -> Result<ControllerState, ClusterError>;

    /// Put an instance into its non-reconciling state.
    async fn pause(&self, id: &ControllerId) -> Result<(), ClusterError>;

    /// Write `saved` back verbatim.
    async fn restore(&self, id: &ControllerId, saved: &ControllerState)
        -> Result<(), ClusterError>;
}

/// Build a merge patch that sets the value at `pointer`.
///
/// `null` removes the field under JSON merge patch semantics.
pub(crate) fn merge_patch_at(pointer: &str, value: Value) -> Value {
    let segments: Vec<&str> = pointer.split('/').skip(1).collect();
    segments
        .into_iter()
        .rev()
        .map(|segment| segment.replace("~1", "/").replace("~0", "~"))
        .fold(value, |inner, key| {
            let mut map = serde_json::Map::new();
            map.insert(key, inner);
            Value::Object(map)
        })
}
