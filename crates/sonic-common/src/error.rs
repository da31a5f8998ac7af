use thiserror::Error;

use crate::condition::ConditionKind;
use crate::placement::Action;

/// Failures surfaced by the placement pipeline. None of these halt the
/// control loop; each one is scoped to a single server, model, or pair.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error("no fresh metrics from server {server_id}: {reason}")]
    ObservationGap { server_id: String, reason: String },

    #[error(
        "model {model_id} is unschedulable: needs {required_bytes} bytes free, \
         {replicas}/{min_replicas} replicas placed"
    )]
    UnschedulableModel {
        model_id: String,
        required_bytes: u64,
        replicas: u32,
        min_replicas: u32,
    },

    #[error("identifier {identifier} for model {name:?} is already issued to {existing:?}")]
    IdentityCollision {
        name: String,
        identifier: String,
        existing: String,
    },

    #[error("{action} of {model_id} on {server_id} failed after {attempts} attempts: {reason}")]
    ReconciliationFailed {
        server_id: String,
        model_id: String,
        action: Action,
        attempts: u32,
        reason: String,
    },

    #[error(
        "stale pool event for {model_id} on {server_id}: ({epoch}, {seq}) is older than \
         applied ({applied_epoch}, {applied_seq})"
    )]
    PoolSyncStale {
        model_id: String,
        server_id: String,
        epoch: u64,
        seq: u64,
        applied_epoch: u64,
        applied_seq: u64,
    },
}

impl PlacementError {
    pub fn kind(&self) -> ConditionKind {
        match self {
            PlacementError::ObservationGap { .. } => ConditionKind::ObservationGap,
            PlacementError::UnschedulableModel { .. } => ConditionKind::UnschedulableModel,
            PlacementError::IdentityCollision { .. } => ConditionKind::IdentityCollision,
            PlacementError::ReconciliationFailed { .. } => ConditionKind::ReconciliationFailed,
            PlacementError::PoolSyncStale { .. } => ConditionKind::PoolSyncStale,
        }
    }

    pub fn server_id(&self) -> Option<&str> {
        match self {
            PlacementError::ObservationGap { server_id, .. }
            | PlacementError::ReconciliationFailed { server_id, .. }
            | PlacementError::PoolSyncStale { server_id, .. } => Some(server_id),
            PlacementError::UnschedulableModel { .. } | PlacementError::IdentityCollision { .. } => {
                None
            }
        }
    }

    /// Model scope of the error. For collisions this is the identifier, since
    /// the rejected name never received one of its own.
    pub fn model_id(&self) -> Option<&str> {
        match self {
            PlacementError::ObservationGap { .. } => None,
            PlacementError::UnschedulableModel { model_id, .. }
            | PlacementError::ReconciliationFailed { model_id, .. }
            | PlacementError::PoolSyncStale { model_id, .. } => Some(model_id),
            PlacementError::IdentityCollision { identifier, .. } => Some(identifier),
        }
    }
}

/// Errors returned by the external adapters (server control, labels, pools).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not ready: {0}")]
    NotReady(String),

    #[error("admission rejected: {0}")]
    AdmissionRejected(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl ControlError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ControlError::Timeout(_)
            | ControlError::Transport(_)
            | ControlError::NotReady(_)
            | ControlError::Backend(_) => true,
            ControlError::Rejected { status, .. } => *status >= 500 || *status == 429,
            ControlError::NotFound(_) | ControlError::AdmissionRejected(_) => false,
        }
    }
}
