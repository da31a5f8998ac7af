use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use sonic_common::{
    ClusterSnapshot, CommittedPlacement, Epoch, HealthStatus, LabelState, ModelSpec,
    PlacementDecision, PlacementError,
};

use crate::demand::DemandSignal;

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerPolicy {
    /// Memory kept free on every server on top of the model footprints.
    pub headroom_mb: u64,
    /// Add a replica when every host has more requests queued than this...
    pub scale_up_queue_depth: u64,
    /// ...or serves more inferences per second than this.
    pub scale_up_request_rate: f64,
    /// A model without traffic for this long loses one surplus replica per cycle.
    pub idle_timeout_ms: u64,
}

impl Default for PlannerPolicy {
    fn default() -> Self {
        Self {
            headroom_mb: 0,
            scale_up_queue_depth: 8,
            scale_up_request_rate: 50.0,
            idle_timeout_ms: 600_000,
        }
    }
}

impl PlannerPolicy {
    fn headroom_bytes(&self) -> u64 {
        self.headroom_mb.saturating_mul(MB)
    }
}

pub struct PlanInput<'a> {
    pub snapshot: &'a ClusterSnapshot,
    pub committed: &'a CommittedPlacement,
    /// Loads handed to the reconciler that have neither committed nor failed.
    pub pending: &'a BTreeMap<String, BTreeSet<String>>,
    pub demand: &'a DemandSignal,
    pub catalog: &'a [ModelSpec],
    /// (server_id, model_id) pairs that must be left as they are.
    pub frozen: &'a BTreeSet<(String, String)>,
    pub now_ms: u64,
    /// Instances not refreshed within this window are unreachable.
    pub stale_threshold_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PlanOutcome {
    pub decision: PlacementDecision,
    pub unschedulable: Vec<PlacementError>,
    pub loads: usize,
    pub unloads: usize,
}

struct Host {
    health: HealthStatus,
    capacity: u64,
    observed_used: u64,
    /// Footprints of everything committed on the host, including draining models.
    committed_bytes: u64,
    added_bytes: u64,
}

impl Host {
    fn usage(&self) -> u64 {
        self.observed_used.max(self.committed_bytes).saturating_add(self.added_bytes)
    }

    fn free(&self, headroom: u64) -> u64 {
        self.capacity.saturating_sub(self.usage()).saturating_sub(headroom)
    }

    fn live(&self) -> bool {
        self.health != HealthStatus::Unreachable
    }
}

/// Compute the target placement for one cycle.
///
/// Starts from the committed routable set plus the loads still in flight,
/// and only changes it where the catalog asks for it: missing minimum
/// replicas and demand-driven scale-up are placed on healthy servers with
/// room, idle surplus replicas are shed.
/// Unreachable servers and frozen pairs keep their committed contents.
pub fn plan(policy: &PlannerPolicy, input: &PlanInput<'_>, epoch: Epoch) -> PlanOutcome {
    let headroom = policy.headroom_bytes();
    let specs: BTreeMap<&str, &ModelSpec> =
        input.catalog.iter().map(|s| (s.model_id.as_str(), s)).collect();

    let mut hosts: BTreeMap<String, Host> = BTreeMap::new();
    let mut targets: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for (server_id, server) in &input.snapshot.servers {
        let committed = input.committed.servers.get(server_id);
        let committed_bytes: u64 = committed
            .map(|models| {
                models
                    .keys()
                    .filter_map(|m| specs.get(m.as_str()))
                    .map(|s| s.memory_footprint_bytes)
                    .sum()
            })
            .unwrap_or(0);
        hosts.insert(
            server_id.clone(),
            Host {
                health: server.effective_health(input.now_ms, input.stale_threshold_ms),
                capacity: server.gpu_memory_total_bytes,
                observed_used: server.gpu_memory_used_bytes,
                committed_bytes,
                added_bytes: 0,
            },
        );
        let routable: BTreeSet<String> = committed
            .map(|models| {
                models
                    .iter()
                    .filter(|(_, e)| e.state == LabelState::Loaded)
                    .map(|(m, _)| m.clone())
                    .collect()
            })
            .unwrap_or_default();
        targets.insert(server_id.clone(), routable);
    }

    // in-flight loads keep their host and their memory
    for (server_id, models) in input.pending {
        let Some(host) = hosts.get_mut(server_id) else {
            continue;
        };
        if !host.live() {
            continue;
        }
        let target = targets.entry(server_id.clone()).or_default();
        for model_id in models {
            let Some(spec) = specs.get(model_id.as_str()) else {
                continue;
            };
            if target.contains(model_id)
                || input.frozen.contains(&(server_id.clone(), model_id.clone()))
            {
                continue;
            }
            let extra = if input.committed.entry(server_id, model_id).is_some() {
                0
            } else {
                spec.memory_footprint_bytes
            };
            if host.committed_bytes.saturating_add(host.added_bytes).saturating_add(extra) > host.capacity {
                debug!(%server_id, %model_id, "pending load no longer fits, releasing it");
                continue;
            }
            host.added_bytes = host.added_bytes.saturating_add(extra);
            target.insert(model_id.clone());
        }
    }

    let mut ordered: Vec<&ModelSpec> = input.catalog.iter().collect();
    ordered.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.model_id.cmp(&b.model_id))
    });

    let mut unschedulable = Vec::new();
    let mut loads = 0usize;

    for spec in &ordered {
        let id = spec.model_id.as_str();
        let live_hosts: Vec<String> = targets
            .iter()
            .filter(|(server_id, models)| models.contains(id) && is_live(&hosts, server_id))
            .map(|(server_id, _)| server_id.clone())
            .collect();
        let replicas = live_hosts.len() as u32;
        let deficit = spec.min_replicas.saturating_sub(replicas);

        let mut wanted = deficit;
        if wanted == 0 && replicas > 0 && replicas < spec.max_replicas && overloaded(policy, input.demand, id, &live_hosts) {
            debug!(model_id = %id, replicas, "all hosts above load threshold, adding a replica");
            wanted = 1;
        }

        let mut placed = 0u32;
        for _ in 0..wanted {
            let Some(server_id) = pick_host(spec, headroom, &hosts, &targets, input) else {
                break;
            };
            if let Some(host) = hosts.get_mut(&server_id) {
                host.added_bytes = host.added_bytes.saturating_add(spec.memory_footprint_bytes);
            }
            targets.entry(server_id).or_default().insert(id.to_string());
            placed += 1;
            loads += 1;
        }

        if placed < deficit {
            unschedulable.push(PlacementError::UnschedulableModel {
                model_id: id.to_string(),
                required_bytes: spec.memory_footprint_bytes,
                replicas: replicas + placed,
                min_replicas: spec.min_replicas,
            });
        }
    }

    let mut unloads = 0usize;
    for spec in &ordered {
        if let Some(server_id) = idle_victim(policy, input, spec, &hosts, &targets) {
            debug!(model_id = %spec.model_id, %server_id, "shedding idle replica");
            if let Some(models) = targets.get_mut(&server_id) {
                models.remove(&spec.model_id);
            }
            unloads += 1;
        }
    }

    if loads > 0 || unloads > 0 || !unschedulable.is_empty() {
        info!(
            epoch,
            loads,
            unloads,
            unschedulable = unschedulable.len(),
            "placement decision computed"
        );
    }

    PlanOutcome {
        decision: PlacementDecision {
            epoch,
            created_at_ms: input.now_ms,
            targets,
        },
        unschedulable,
        loads,
        unloads,
    }
}

fn is_live(hosts: &BTreeMap<String, Host>, server_id: &str) -> bool {
    hosts.get(server_id).is_some_and(Host::live)
}

fn overloaded(policy: &PlannerPolicy, demand: &DemandSignal, model_id: &str, hosts: &[String]) -> bool {
    !hosts.is_empty()
        && hosts.iter().all(|server_id| {
            demand.on_server(model_id, server_id).is_some_and(|d| {
                d.queue_depth > policy.scale_up_queue_depth
                    || d.request_rate > policy.scale_up_request_rate
            })
        })
}

/// Healthy server with the most free memory that can take the model; ties go
/// to the server with fewer models, then to the lower id.
fn pick_host(
    spec: &ModelSpec,
    headroom: u64,
    hosts: &BTreeMap<String, Host>,
    targets: &BTreeMap<String, BTreeSet<String>>,
    input: &PlanInput<'_>,
) -> Option<String> {
    let id = spec.model_id.as_str();
    hosts
        .iter()
        .filter(|(_, h)| h.health == HealthStatus::Healthy)
        .filter(|(server_id, _)| {
            !targets.get(server_id.as_str()).is_some_and(|m| m.contains(id))
                && !input.committed.is_loaded(server_id, id)
                && !input.frozen.contains(&(server_id.to_string(), id.to_string()))
        })
        .filter(|(_, h)| {
            h.free(headroom) >= spec.memory_footprint_bytes
                && h.committed_bytes
                    .saturating_add(h.added_bytes)
                    .saturating_add(spec.memory_footprint_bytes)
                    <= h.capacity
        })
        .min_by_key(|&(server_id, h)| {
            let count = targets.get(server_id.as_str()).map_or(0, |m| m.len());
            (Reverse(h.free(headroom)), count, server_id.as_str())
        })
        .map(|(server_id, _)| server_id.clone())
}

/// Least recently used live host of an idle model with replicas to spare.
fn idle_victim(
    policy: &PlannerPolicy,
    input: &PlanInput<'_>,
    spec: &ModelSpec,
    hosts: &BTreeMap<String, Host>,
    targets: &BTreeMap<String, BTreeSet<String>>,
) -> Option<String> {
    let id = spec.model_id.as_str();
    let demand = input.demand.model(id)?;
    if input.now_ms.saturating_sub(demand.last_request_ms) < policy.idle_timeout_ms {
        return None;
    }

    // only committed replicas count toward the floor; pending loads may still fail
    let live: Vec<&str> = targets
        .iter()
        .filter(|(server_id, models)| {
            models.contains(id) && is_live(hosts, server_id) && input.committed.is_routable(server_id, id)
        })
        .map(|(server_id, _)| server_id.as_str())
        .collect();
    if live.len() as u32 <= spec.min_replicas {
        return None;
    }

    live.into_iter()
        .filter(|server_id| !input.frozen.contains(&(server_id.to_string(), id.to_string())))
        .min_by_key(|server_id| {
            let last = input.demand.on_server(id, server_id).map_or(0, |d| d.last_request_ms);
            (last, *server_id)
        })
        .map(str::to_string)
}

/// Owns the epoch counter and turns observations into decisions.
#[derive(Debug)]
pub struct DecisionEngine {
    policy: PlannerPolicy,
    last_epoch: Epoch,
}

impl DecisionEngine {
    pub fn new(policy: PlannerPolicy, last_epoch: Epoch) -> Self {
        Self { policy, last_epoch }
    }

    pub fn last_epoch(&self) -> Epoch {
        self.last_epoch
    }

    /// Never moves the counter backwards.
    pub fn advance_to(&mut self, epoch: Epoch) {
        self.last_epoch = self.last_epoch.max(epoch);
    }

    pub fn decide(&mut self, input: &PlanInput<'_>) -> PlanOutcome {
        self.last_epoch += 1;
        plan(&self.policy, input, self.last_epoch)
    }
}
