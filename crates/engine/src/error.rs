//! Typed error model for manager operations.

use konverge_applier::ApplierError;
use konverge_cluster::ClusterError;
use konverge_core::{Action, Change, ManifestError};
use konverge_diff::RenderError;
use konverge_inventory::InventoryError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An input manifest already carries a foreign owning-inventory
    /// annotation. Rejected before any side effect, regardless of policy.
    #[error("object {path} already has an inventory annotation")]
    AnnotationConflict { path: String },

    /// Adopting the live object would violate the configured inventory
    /// policy.
    #[error("inventory policy check failure for object {path}: {reason}")]
    PolicyViolation { path: String, reason: String },

    #[error("apply dry run failed for {path}")]
    DryRun {
        path: String,
        #[source]
        source: ApplierError,
    },

    /// The capability reported an action the orchestrator cannot reconcile.
    #[error("unexpected {action} action taken by the resource manager for {subject}")]
    UnexpectedAction { action: Action, subject: String },

    #[error("failed to get prune objects")]
    PruneLookup(#[source] InventoryError),

    /// The background event-stream task died without reporting a result.
    #[error("apply event stream terminated abnormally")]
    StreamAborted,

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Applier(#[from] ApplierError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<EngineError>),
}

/// Fold two optional errors into one, flattening nested `Multiple`s.
pub(crate) fn join(a: Option<EngineError>, b: Option<EngineError>) -> Option<EngineError> {
    match (a, b) {
        (None, None) => None,
        (Some(e), None) | (None, Some(e)) => Some(e),
        (Some(a), Some(b)) => {
            let mut list = match a {
                EngineError::Multiple(v) => v,
                other => vec![other],
            };
            match b {
                EngineError::Multiple(v) => list.extend(v),
                other => list.push(other),
            }
            Some(EngineError::Multiple(list))
        }
    }
}

/// Failure of an apply that may have taken effect partially. `changes`
/// carries every outcome collected before and during the failure so callers
/// can log what actually happened.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ApplyFailure {
    pub changes: Vec<Change>,
    pub error: EngineError,
}

impl ApplyFailure {
    pub fn new(changes: Vec<Change>, error: EngineError) -> Self {
        Self { changes, error }
    }

    /// A failure with no side effects to report.
    pub fn bare(error: EngineError) -> Self {
        Self { changes: Vec::new(), error }
    }
}
