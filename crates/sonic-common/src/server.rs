use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unreachable,
}

/// A discovered inference server (one pod of the serving deployment).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerTarget {
    pub server_id: String,
    /// Pod IP or host name; ports are a deployment-wide setting.
    pub address: String,
}

/// Per-model traffic counters as reported by the server.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelTraffic {
    /// Monotonic count of completed inferences.
    pub inference_count: u64,
    /// Requests currently queued.
    pub pending_requests: u64,
}

/// One point-in-time reading from the metrics source.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerSample {
    pub gpu_memory_total_bytes: u64,
    pub gpu_memory_used_bytes: u64,
    /// Mean utilization across GPUs, 0.0 to 1.0.
    pub gpu_utilization: f64,
    pub ready: bool,
    /// Keyed by the model name the server reports.
    #[serde(default)]
    pub traffic: BTreeMap<String, ModelTraffic>,
    pub observed_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerInstance {
    pub server_id: String,
    pub address: String,
    pub gpu_memory_total_bytes: u64,
    pub gpu_memory_used_bytes: u64,
    pub gpu_utilization: f64,
    /// Committed loaded-model identifiers; filled from the reconciler's ledger.
    #[serde(default)]
    pub loaded_models: BTreeSet<String>,
    pub health: HealthStatus,
    /// 0 until the first successful observation.
    pub last_observed_ms: u64,
}

impl ServerInstance {
    pub fn unobserved(target: &ServerTarget) -> Self {
        Self {
            server_id: target.server_id.clone(),
            address: target.address.clone(),
            gpu_memory_total_bytes: 0,
            gpu_memory_used_bytes: 0,
            gpu_utilization: 0.0,
            loaded_models: BTreeSet::new(),
            health: HealthStatus::Unreachable,
            last_observed_ms: 0,
        }
    }

    /// Health as the planner must see it: anything not refreshed within
    /// `stale_threshold_ms` is unreachable regardless of its last report.
    pub fn effective_health(&self, now_ms: u64, stale_threshold_ms: u64) -> HealthStatus {
        if self.last_observed_ms == 0
            || now_ms.saturating_sub(self.last_observed_ms) > stale_threshold_ms
        {
            return HealthStatus::Unreachable;
        }
        self.health
    }
}

/// Versioned view of every known server's resources and health.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterSnapshot {
    pub version: u64,
    pub taken_at_ms: u64,
    pub servers: BTreeMap<String, ServerInstance>,
}

impl ClusterSnapshot {
    pub fn server(&self, server_id: &str) -> Option<&ServerInstance> {
        self.servers.get(server_id)
    }

    /// Copy the committed loaded sets into the per-server view.
    pub fn with_committed(mut self, committed: &crate::CommittedPlacement) -> Self {
        for (server_id, server) in self.servers.iter_mut() {
            server.loaded_models = committed.loaded_models(server_id);
        }
        self
    }
}
