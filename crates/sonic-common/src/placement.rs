use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonic version tag of a placement decision.
pub type Epoch = u64;

/// Target placement produced by one decision cycle. Immutable once emitted;
/// a newer epoch supersedes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlacementDecision {
    pub epoch: Epoch,
    pub created_at_ms: u64,
    /// server_id -> model identifiers the server should host.
    pub targets: BTreeMap<String, BTreeSet<String>>,
}

impl PlacementDecision {
    pub fn target_for(&self, server_id: &str) -> Option<&BTreeSet<String>> {
        self.targets.get(server_id)
    }

    pub fn hosts_of<'a>(&'a self, model_id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.targets
            .iter()
            .filter(move |(_, models)| models.contains(model_id))
            .map(|(server_id, _)| server_id.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Load,
    Unload,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Load => write!(f, "load"),
            Action::Unload => write!(f, "unload"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InFlight,
    Committed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Committed | TaskState::Failed)
    }
}

/// One unit of convergence work for a single server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconciliationTask {
    pub server_id: String,
    pub model_id: String,
    pub action: Action,
    pub epoch: Epoch,
    pub state: TaskState,
    pub attempts: u32,
}

impl ReconciliationTask {
    pub fn new(server_id: &str, model_id: &str, action: Action, epoch: Epoch) -> Self {
        Self {
            server_id: server_id.to_string(),
            model_id: model_id.to_string(),
            action,
            epoch,
            state: TaskState::Pending,
            attempts: 0,
        }
    }

    pub fn start(&mut self) {
        if self.state == TaskState::Pending {
            self.state = TaskState::InFlight;
        }
    }

    pub fn finish(&mut self, committed: bool, attempts: u32) {
        if self.state.is_terminal() {
            return;
        }
        self.attempts = attempts;
        self.state = if committed {
            TaskState::Committed
        } else {
            TaskState::Failed
        };
    }
}

/// Value of a `model.<id>` pod label.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LabelState {
    /// Loaded, confirmed serving, routable.
    Loaded,
    /// Still loaded but withdrawn from routing ahead of an unload.
    Draining,
}

impl LabelState {
    pub fn as_str(self) -> &'static str {
        match self {
            LabelState::Loaded => "loaded",
            LabelState::Draining => "draining",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "loaded" => Some(LabelState::Loaded),
            "draining" => Some(LabelState::Draining),
            _ => None,
        }
    }
}

/// Committed state of one (server, model) pair with the ordering key of the
/// transition that produced it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommittedEntry {
    pub state: LabelState,
    pub epoch: Epoch,
    pub seq: u64,
}

/// Label-backed placement as confirmed by the reconciler.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommittedPlacement {
    pub version: u64,
    pub servers: BTreeMap<String, BTreeMap<String, CommittedEntry>>,
}

impl CommittedPlacement {
    pub fn entry(&self, server_id: &str, model_id: &str) -> Option<&CommittedEntry> {
        self.servers.get(server_id)?.get(model_id)
    }

    /// Models physically loaded on the server (routable or draining).
    pub fn loaded_models(&self, server_id: &str) -> BTreeSet<String> {
        self.servers
            .get(server_id)
            .map(|models| models.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_loaded(&self, server_id: &str, model_id: &str) -> bool {
        self.entry(server_id, model_id).is_some()
    }

    pub fn is_routable(&self, server_id: &str, model_id: &str) -> bool {
        matches!(
            self.entry(server_id, model_id),
            Some(CommittedEntry { state: LabelState::Loaded, .. })
        )
    }

    /// (server_id, entry) for every routable host of the model.
    pub fn routable_hosts<'a>(
        &'a self,
        model_id: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a CommittedEntry)> + 'a {
        self.servers.iter().filter_map(move |(server_id, models)| {
            models
                .get(model_id)
                .filter(|e| e.state == LabelState::Loaded)
                .map(|e| (server_id.as_str(), e))
        })
    }
}
