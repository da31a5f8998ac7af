use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use sonic_common::{
    now_ms, ClusterSnapshot, ConditionKind, ControlError, HealthStatus, PlacementError,
    ServerInstance, ServerSample, ServerTarget,
};

use crate::backend::{MetricsSource, ServerDirectory};
use crate::conditions::ConditionBoard;
use crate::demand::{DemandSignal, DemandTracker};
use crate::metrics::SharedMetrics;
use crate::registry::IdentityRegistry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverPolicy {
    pub poll_interval_ms: u64,
    /// Upper bound for one server's sample.
    pub sample_timeout_ms: u64,
    /// Instances not refreshed within this window count as unreachable.
    pub stale_threshold_ms: u64,
    /// Mean GPU utilization at or above which a server is degraded.
    pub degraded_utilization: f64,
}

impl Default for ObserverPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            sample_timeout_ms: 3_000,
            stale_threshold_ms: 30_000,
            degraded_utilization: 0.95,
        }
    }
}

/// What the decision loop consumes each cycle.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub snapshot: Arc<ClusterSnapshot>,
    pub demand: Arc<DemandSignal>,
}

pub struct Observer {
    directory: Arc<dyn ServerDirectory>,
    source: Arc<dyn MetricsSource>,
    registry: Arc<IdentityRegistry>,
    conditions: Arc<ConditionBoard>,
    metrics: Arc<SharedMetrics>,
    policy: ObserverPolicy,
    targets: Vec<ServerTarget>,
    servers: BTreeMap<String, ServerInstance>,
    demand: DemandTracker,
    version: u64,
    tx: watch::Sender<Arc<Observation>>,
}

impl Observer {
    pub fn new(
        directory: Arc<dyn ServerDirectory>,
        source: Arc<dyn MetricsSource>,
        registry: Arc<IdentityRegistry>,
        conditions: Arc<ConditionBoard>,
        metrics: Arc<SharedMetrics>,
        policy: ObserverPolicy,
    ) -> (Self, watch::Receiver<Arc<Observation>>) {
        let (tx, rx) = watch::channel(Arc::new(Observation::default()));
        let observer = Self {
            directory,
            source,
            registry,
            conditions,
            metrics,
            policy,
            targets: Vec::new(),
            servers: BTreeMap::new(),
            demand: DemandTracker::new(),
            version: 0,
            tx,
        };
        (observer, rx)
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.policy.poll_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = self.policy.poll_interval_ms, "observer started");
        loop {
            ticker.tick().await;
            self.observe_once().await;
        }
    }

    /// Refresh the server list, sample every server concurrently, and publish
    /// a new snapshot. A failing server never delays the others beyond the
    /// sample timeout.
    pub async fn observe_once(&mut self) -> Arc<Observation> {
        self.refresh_targets().await;

        let timeout = Duration::from_millis(self.policy.sample_timeout_ms);
        let source = self.source.clone();
        let samples = join_all(self.targets.iter().map(|target| {
            let source = source.clone();
            async move {
                let result = match tokio::time::timeout(timeout, source.sample(target)).await {
                    Ok(r) => r,
                    Err(_) => Err(ControlError::Timeout(timeout.as_millis() as u64)),
                };
                (target.clone(), result)
            }
        }))
        .await;

        for (target, result) in samples {
            match result {
                Ok(sample) => self.apply_sample(&target, sample),
                Err(e) => self.record_gap(&target, e),
            }
        }

        let now = now_ms();
        self.version += 1;
        let snapshot = ClusterSnapshot {
            version: self.version,
            taken_at_ms: now,
            servers: self.servers.clone(),
        };
        let fresh = snapshot
            .servers
            .values()
            .filter(|s| s.effective_health(now, self.policy.stale_threshold_ms) != HealthStatus::Unreachable)
            .count();
        SharedMetrics::set(&self.metrics.servers_known, snapshot.servers.len() as u64);
        SharedMetrics::set(&self.metrics.servers_fresh, fresh as u64);

        let observation = Arc::new(Observation {
            snapshot: Arc::new(snapshot),
            demand: Arc::new(self.demand.signal()),
        });
        self.tx.send_replace(observation.clone());
        observation
    }

    async fn refresh_targets(&mut self) {
        let targets = match self.directory.list_servers().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "server discovery failed, keeping previous server list");
                return;
            }
        };

        let listed: BTreeSet<&str> = targets.iter().map(|t| t.server_id.as_str()).collect();
        let gone: Vec<String> = self
            .servers
            .keys()
            .filter(|id| !listed.contains(id.as_str()))
            .cloned()
            .collect();
        for server_id in gone {
            info!(%server_id, "server left the deployment");
            self.servers.remove(&server_id);
            self.demand.forget_server(&server_id);
            self.conditions
                .resolve(ConditionKind::ObservationGap, Some(&server_id), None);
        }

        for target in &targets {
            let instance = self
                .servers
                .entry(target.server_id.clone())
                .or_insert_with(|| {
                    info!(server_id = %target.server_id, address = %target.address, "server discovered");
                    ServerInstance::unobserved(target)
                });
            instance.address = target.address.clone();
        }
        self.targets = targets;
    }

    fn apply_sample(&mut self, target: &ServerTarget, sample: ServerSample) {
        let health = if !sample.ready || sample.gpu_utilization >= self.policy.degraded_utilization {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        if let Some(instance) = self.servers.get_mut(&target.server_id) {
            if instance.health != health {
                debug!(server_id = %target.server_id, from = ?instance.health, to = ?health, "server health changed");
            }
            instance.gpu_memory_total_bytes = sample.gpu_memory_total_bytes;
            instance.gpu_memory_used_bytes = sample.gpu_memory_used_bytes;
            instance.gpu_utilization = sample.gpu_utilization;
            instance.health = health;
            instance.last_observed_ms = sample.observed_at_ms;
        }

        let mut seen = Vec::with_capacity(sample.traffic.len());
        for (name, traffic) in &sample.traffic {
            let Some(model_id) = self.registry.identifier_for(name) else {
                continue;
            };
            self.demand
                .record(&target.server_id, &model_id, *traffic, sample.observed_at_ms);
            seen.push(model_id);
        }
        self.demand.retain_server(&target.server_id, &seen);

        self.conditions
            .resolve(ConditionKind::ObservationGap, Some(&target.server_id), None);
    }

    fn record_gap(&mut self, target: &ServerTarget, err: ControlError) {
        SharedMetrics::inc(&self.metrics.observation_gaps_total);
        warn!(server_id = %target.server_id, error = %err, "failed to sample server");
        // the previous reading stays and ages out through the stale threshold
        self.conditions.report(&PlacementError::ObservationGap {
            server_id: target.server_id.clone(),
            reason: err.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{EventLog, MemoryCluster};
    use sonic_common::{ModelConfig, ModelTraffic};
    use sonic_meta::{MemoryMetaStore, MetaStore};

    const GB: u64 = 1024 * 1024 * 1024;

    async fn setup(cluster: &MemoryCluster) -> (Observer, Arc<ConditionBoard>) {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let registry = Arc::new(IdentityRegistry::load(store).await.unwrap());
        registry
            .register(&ModelConfig {
                name: "DeepMET".into(),
                memory_footprint_mb: 1024,
                min_replicas: 1,
                max_replicas: None,
                priority: 0,
            })
            .await
            .unwrap();
        let conditions = Arc::new(ConditionBoard::new());
        let (observer, _rx) = Observer::new(
            Arc::new(cluster.clone()),
            Arc::new(cluster.clone()),
            registry,
            conditions.clone(),
            Arc::new(SharedMetrics::default()),
            ObserverPolicy::default(),
        );
        (observer, conditions)
    }

    #[tokio::test]
    async fn test_snapshot_reflects_samples() {
        let cluster = MemoryCluster::new(EventLog::default());
        cluster.add_server("triton-0", 16 * GB);
        cluster.add_server("triton-1", 8 * GB);
        cluster.set_utilization("triton-1", 0.99);
        let (mut observer, _) = setup(&cluster).await;

        let obs = observer.observe_once().await;
        let s0 = obs.snapshot.server("triton-0").unwrap();
        assert_eq!(s0.gpu_memory_total_bytes, 16 * GB);
        assert_eq!(s0.health, HealthStatus::Healthy);
        assert_eq!(obs.snapshot.server("triton-1").unwrap().health, HealthStatus::Degraded);
        assert_eq!(obs.snapshot.version, 1);
    }

    #[tokio::test]
    async fn test_failed_sample_keeps_previous_reading() {
        let cluster = MemoryCluster::new(EventLog::default());
        cluster.add_server("triton-0", 16 * GB);
        cluster.add_server("triton-1", 16 * GB);
        let (mut observer, conditions) = setup(&cluster).await;

        let first = observer.observe_once().await;
        let before = first.snapshot.server("triton-1").unwrap().last_observed_ms;

        cluster.set_reachable("triton-1", false);
        let second = observer.observe_once().await;
        let s1 = second.snapshot.server("triton-1").unwrap();
        assert_eq!(s1.last_observed_ms, before);
        assert!(second.snapshot.server("triton-0").unwrap().last_observed_ms >= before);
        assert_eq!(conditions.count(ConditionKind::ObservationGap), 1);

        // the gap ages out into unreachable
        let policy = ObserverPolicy::default();
        assert_eq!(
            s1.effective_health(before + policy.stale_threshold_ms + 1, policy.stale_threshold_ms),
            HealthStatus::Unreachable
        );

        cluster.set_reachable("triton-1", true);
        observer.observe_once().await;
        assert_eq!(conditions.count(ConditionKind::ObservationGap), 0);
    }

    #[tokio::test]
    async fn test_demand_keyed_by_identifier() {
        let cluster = MemoryCluster::new(EventLog::default());
        cluster.add_server("triton-0", 16 * GB);
        cluster.preload("triton-0", "DeepMET");
        cluster.preload("triton-0", "unregistered");
        cluster.set_traffic(
            "triton-0",
            "DeepMET",
            ModelTraffic {
                inference_count: 10,
                pending_requests: 3,
            },
        );
        cluster.set_traffic("triton-0", "unregistered", ModelTraffic::default());
        let (mut observer, _) = setup(&cluster).await;

        let obs = observer.observe_once().await;
        let d = obs.demand.on_server("deepmet", "triton-0").unwrap();
        assert_eq!(d.queue_depth, 3);
        assert_eq!(obs.demand.models.len(), 1);
    }

    #[tokio::test]
    async fn test_departed_server_is_dropped() {
        let cluster = MemoryCluster::new(EventLog::default());
        cluster.add_server("triton-0", 16 * GB);
        cluster.add_server("triton-1", 16 * GB);
        let (mut observer, _) = setup(&cluster).await;
        observer.observe_once().await;

        cluster.remove_server("triton-1");
        let obs = observer.observe_once().await;
        assert!(obs.snapshot.server("triton-1").is_none());
        assert_eq!(obs.snapshot.servers.len(), 1);
    }
}
