use serde::{Deserialize, Serialize};

use crate::error::PlacementError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    ObservationGap,
    UnschedulableModel,
    IdentityCollision,
    ReconciliationFailed,
    PoolSyncStale,
}

/// (kind, server_id, model_id)
pub type ConditionKey = (ConditionKind, Option<String>, Option<String>);

/// A queryable status entry describing an ongoing or recent failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Condition {
    pub kind: ConditionKind,
    pub server_id: Option<String>,
    pub model_id: Option<String>,
    pub message: String,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub occurrences: u64,
}

impl Condition {
    pub fn from_error(err: &PlacementError, now_ms: u64) -> Self {
        Self {
            kind: err.kind(),
            server_id: err.server_id().map(str::to_string),
            model_id: err.model_id().map(str::to_string),
            message: err.to_string(),
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
            occurrences: 1,
        }
    }

    pub fn key(&self) -> ConditionKey {
        (self.kind, self.server_id.clone(), self.model_id.clone())
    }
}
