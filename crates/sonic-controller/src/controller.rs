//! Wiring of the control loop: identity registration, ledger rebuild, the
//! long-running observer and pool bridge, and the decision loop that feeds
//! the reconciler.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use sonic_common::{now_ms, ConditionKind, PlacementDecision};
use sonic_meta::MetaStore;

use crate::backend::{
    LabelApi, MetricsSource, PoolApi, ServerControl, ServerDirectory, ServiceApi,
};
use crate::conditions::ConditionBoard;
use crate::config::ControllerConfig;
use crate::epoch::{EpochStore, Persisted};
use crate::ledger::CommittedLedger;
use crate::metrics::SharedMetrics;
use crate::observer::{Observation, Observer};
use crate::planner::{DecisionEngine, PlanInput};
use crate::pool_sync::PoolSyncBridge;
use crate::reconcile::{rebuild_ledger, routable_events, Reconciler};
use crate::registry::{IdentityRegistry, RegistryError};
use crate::state::AppState;

/// External systems the controller talks to.
pub struct Backends {
    pub directory: Arc<dyn ServerDirectory>,
    pub metrics_source: Arc<dyn MetricsSource>,
    pub control: Arc<dyn ServerControl>,
    pub labels: Arc<dyn LabelApi>,
    pub pools: Arc<dyn PoolApi>,
    pub services: Arc<dyn ServiceApi>,
}

/// Keeps one headless service per catalog model.
struct ServicePublisher {
    api: Arc<dyn ServiceApi>,
    cfg: ControllerConfig,
    published: BTreeSet<String>,
}

impl ServicePublisher {
    /// Apply the service of every catalog model not yet published. Transient
    /// failures are retried on the next call.
    async fn publish(&mut self, registry: &IdentityRegistry) {
        for spec in registry.catalog() {
            if self.published.contains(&spec.model_id) {
                continue;
            }
            let service = self.cfg.model_service(&spec.model_id);
            match self.api.ensure_service(&service).await {
                Ok(()) => {
                    debug!(service = %service.name, "model service applied");
                    self.published.insert(spec.model_id);
                }
                Err(e) if e.is_transient() => {
                    warn!(service = %service.name, error = %e, "model service not applied, will retry");
                }
                Err(e) => {
                    error!(service = %service.name, error = %e, "model service rejected");
                    self.published.insert(spec.model_id);
                }
            }
        }
    }
}

pub struct DecisionLoop {
    interval: Duration,
    stale_threshold_ms: u64,
    engine: DecisionEngine,
    epochs: EpochStore,
    registry: Arc<IdentityRegistry>,
    conditions: Arc<ConditionBoard>,
    metrics: Arc<SharedMetrics>,
    ledger: Arc<CommittedLedger>,
    reconciler: Reconciler,
    observations: watch::Receiver<Arc<Observation>>,
    decisions: watch::Sender<Arc<PlacementDecision>>,
    services: ServicePublisher,
}

/// Bring every component up and return the status state together with the
/// decision loop, which the caller drives.
pub async fn start(
    cfg: &ControllerConfig,
    store: Arc<dyn MetaStore>,
    backends: Backends,
    instance_id: String,
) -> Result<(AppState, DecisionLoop)> {
    let conditions = Arc::new(ConditionBoard::new());
    let metrics = Arc::new(SharedMetrics::default());

    let registry = Arc::new(IdentityRegistry::load(store.clone()).await?);
    for model in &cfg.models {
        match registry.register(model).await {
            Ok(spec) => debug!(name = %spec.name, model_id = %spec.model_id, "model registered"),
            Err(RegistryError::Collision(err)) => {
                // the colliding model stays out of the catalog; everything else proceeds
                error!(%err, "model not registered");
                SharedMetrics::inc(&metrics.identity_collisions_total);
                conditions.report(&err);
            }
            Err(RegistryError::Store(e)) => return Err(e),
        }
    }

    let mut services = ServicePublisher {
        api: backends.services,
        cfg: cfg.clone(),
        published: BTreeSet::new(),
    };
    services.publish(&registry).await;

    let (epochs, last_epoch) = EpochStore::open(store.clone()).await?;
    info!(last_epoch, models = registry.catalog().len(), "controller state loaded");

    let servers = match backends.directory.list_servers().await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "initial server discovery failed, starting with an empty ledger");
            Vec::new()
        }
    };
    let placement = rebuild_ledger(
        backends.labels.as_ref(),
        backends.control.as_ref(),
        &registry,
        &servers,
    )
    .await;
    let initial_events = routable_events(&placement, &servers);
    let ledger = Arc::new(CommittedLedger::new(placement));

    let (bridge, pool_handle, pool_view) = PoolSyncBridge::new(
        backends.pools,
        ledger.subscribe(),
        conditions.clone(),
        metrics.clone(),
        cfg.pool_sync.clone(),
    );
    tokio::spawn(bridge.run());
    for event in initial_events {
        if let Err(e) = pool_handle.publish(event).await {
            warn!(error = %e, "failed to republish committed endpoint");
        }
    }

    let (observer, observations) = Observer::new(
        backends.directory,
        backends.metrics_source,
        registry.clone(),
        conditions.clone(),
        metrics.clone(),
        cfg.observer.clone(),
    );
    tokio::spawn(observer.run());

    let reconciler = Reconciler::new(
        backends.control,
        backends.labels,
        ledger.clone(),
        pool_handle,
        registry.clone(),
        conditions.clone(),
        metrics.clone(),
        cfg.reconcile.clone(),
    );
    let (decisions, decisions_rx) = watch::channel(Arc::new(PlacementDecision::default()));

    let state = AppState {
        instance_id,
        started_at: chrono::Utc::now(),
        registry: registry.clone(),
        conditions: conditions.clone(),
        metrics: metrics.clone(),
        ledger: ledger.clone(),
        tasks: reconciler.history(),
        observations: observations.clone(),
        decisions: decisions_rx,
        pools: pool_view,
        observer_policy: cfg.observer.clone(),
    };

    let decision_loop = DecisionLoop {
        interval: Duration::from_millis(cfg.decision_interval_ms),
        stale_threshold_ms: cfg.observer.stale_threshold_ms,
        engine: DecisionEngine::new(cfg.planner.clone(), last_epoch),
        epochs,
        registry,
        conditions,
        metrics,
        ledger,
        reconciler,
        observations,
        decisions,
        services,
    };
    Ok((state, decision_loop))
}

impl DecisionLoop {
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis() as u64, "decision loop started");
        loop {
            ticker.tick().await;
            if let Err(e) = self.cycle().await {
                warn!(error = %e, "decision cycle failed");
            }
        }
    }

    /// One decision cycle. Returns the emitted decision, or `None` when the
    /// cycle was skipped.
    pub async fn cycle(&mut self) -> Result<Option<Arc<PlacementDecision>>> {
        self.services.publish(&self.registry).await;

        let observation = self.observations.borrow().clone();
        if observation.snapshot.version == 0 {
            debug!("no observation yet, skipping decision");
            return Ok(None);
        }

        // read before the ledger: a load leaves the pending set only after it commits
        let pending = self.reconciler.pending();
        let committed = self.ledger.snapshot();
        let snapshot = observation.snapshot.as_ref().clone().with_committed(&committed);
        let catalog = self.registry.catalog();
        let frozen = self.conditions.failed_pairs();
        let input = PlanInput {
            snapshot: &snapshot,
            committed: &committed,
            pending: &pending,
            demand: &observation.demand,
            catalog: &catalog,
            frozen: &frozen,
            now_ms: now_ms(),
            stale_threshold_ms: self.stale_threshold_ms,
        };
        let outcome = self.engine.decide(&input);
        let epoch = outcome.decision.epoch;

        if let Persisted::Behind(stored) = self.epochs.persist(epoch).await? {
            warn!(epoch, stored, "a newer epoch was persisted elsewhere, skipping ahead");
            self.engine.advance_to(stored);
            return Ok(None);
        }

        self.conditions
            .replace_kind(ConditionKind::UnschedulableModel, &outcome.unschedulable);

        let m = &self.metrics;
        SharedMetrics::inc(&m.decision_cycles_total);
        SharedMetrics::set(&m.decision_epoch, epoch);
        SharedMetrics::add(&m.planned_loads_total, outcome.loads as u64);
        SharedMetrics::add(&m.planned_unloads_total, outcome.unloads as u64);
        SharedMetrics::set(&m.unschedulable_models, outcome.unschedulable.len() as u64);

        if outcome.loads + outcome.unloads > 0 {
            info!(epoch, loads = outcome.loads, unloads = outcome.unloads, "placement changed");
        } else {
            debug!(epoch, "placement unchanged");
        }

        self.reconciler.apply(&outcome.decision, &snapshot);
        let decision = Arc::new(outcome.decision);
        self.decisions.send_replace(decision.clone());
        Ok(Some(decision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{
        EventLog, MemoryCluster, MemoryLabelApi, MemoryPoolApi, MemoryServiceApi, Recorded,
    };
    use sonic_common::{LabelState, ModelConfig};
    use sonic_meta::MemoryMetaStore;

    const GB: u64 = 1024 * 1024 * 1024;

    fn config(models: &[(&str, u64)]) -> ControllerConfig {
        let mut cfg = ControllerConfig::default();
        cfg.models = models
            .iter()
            .map(|(name, mb)| ModelConfig {
                name: name.to_string(),
                memory_footprint_mb: *mb,
                min_replicas: 1,
                max_replicas: None,
                priority: 0,
            })
            .collect();
        cfg.reconcile.retry.initial_delay_ms = 1;
        cfg.reconcile.retry.max_delay_ms = 5;
        cfg.pool_sync.retry_delay_ms = 5;
        cfg
    }

    #[tokio::test]
    async fn test_end_to_end_placement() {
        let log = EventLog::default();
        let cluster = MemoryCluster::new(log.clone());
        cluster.add_server("triton-0", 16 * GB);
        cluster.add_server("triton-1", 16 * GB);
        let labels = MemoryLabelApi::new(log.clone());
        let pools = MemoryPoolApi::new(log.clone());
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());

        let backends = Backends {
            directory: Arc::new(cluster.clone()),
            metrics_source: Arc::new(cluster.clone()),
            control: Arc::new(cluster.clone()),
            labels: Arc::new(labels.clone()),
            pools: Arc::new(pools.clone()),
            services: Arc::new(MemoryServiceApi::new()),
        };
        let cfg = config(&[("DeepMET", 1024)]);
        let (state, mut decisions) = start(&cfg, store.clone(), backends, "test".into()).await.unwrap();

        let mut observations = state.observations.clone();
        tokio::time::timeout(Duration::from_secs(5), observations.wait_for(|o| o.snapshot.version > 0))
            .await
            .unwrap()
            .unwrap();

        let decision = decisions.cycle().await.unwrap().unwrap();
        assert_eq!(decision.epoch, 1);
        assert_eq!(decision.hosts_of("deepmet").count(), 1);

        let mut committed = state.ledger.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            committed.wait_for(|c| c.routable_hosts("deepmet").count() == 1),
        )
        .await
        .unwrap()
        .unwrap();
        let host = state.ledger.snapshot().routable_hosts("deepmet").next().unwrap().0.to_string();
        assert_eq!(labels.snapshot()[&host]["deepmet"], LabelState::Loaded);
        assert!(cluster.loaded(&host).contains("DeepMET"));

        // the epoch survives a restart of the decision engine
        let (_, last) = EpochStore::open(store).await.unwrap();
        assert_eq!(last, 1);
        assert_eq!(state.metrics.decision_cycles_total.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_inflight_load_keeps_its_host() {
        let log = EventLog::default();
        let cluster = MemoryCluster::new(log.clone());
        cluster.add_server("triton-0", 16 * GB);
        cluster.add_server("triton-1", 16 * GB);
        cluster.hold_loads("triton-0", true);
        let backends = Backends {
            directory: Arc::new(cluster.clone()),
            metrics_source: Arc::new(cluster.clone()),
            control: Arc::new(cluster.clone()),
            labels: Arc::new(MemoryLabelApi::new(log.clone())),
            pools: Arc::new(MemoryPoolApi::new(log.clone())),
            services: Arc::new(MemoryServiceApi::new()),
        };
        let mut cfg = config(&[("DeepMET", 1024)]);
        cfg.models[0].max_replicas = Some(1);
        cfg.observer.poll_interval_ms = 10;
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let (state, mut decisions) = start(&cfg, store, backends, "test".into()).await.unwrap();

        let mut observations = state.observations.clone();
        tokio::time::timeout(Duration::from_secs(5), observations.wait_for(|o| o.snapshot.version > 0))
            .await
            .unwrap()
            .unwrap();
        let first = decisions.cycle().await.unwrap().unwrap();
        assert_eq!(first.hosts_of("deepmet").collect::<Vec<_>>(), vec!["triton-0"]);

        // the host turns busy before its load has committed
        cluster.set_utilization("triton-0", 0.99);
        tokio::time::timeout(
            Duration::from_secs(5),
            observations.wait_for(|o| {
                o.snapshot
                    .server("triton-0")
                    .is_some_and(|s| s.health == sonic_common::HealthStatus::Degraded)
            }),
        )
        .await
        .unwrap()
        .unwrap();
        let second = decisions.cycle().await.unwrap().unwrap();
        assert_eq!(second.hosts_of("deepmet").collect::<Vec<_>>(), vec!["triton-0"]);

        cluster.hold_loads("triton-0", false);
        let mut committed = state.ledger.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            committed.wait_for(|c| c.is_routable("triton-0", "deepmet")),
        )
        .await
        .unwrap()
        .unwrap();

        let events = log.events();
        let loads = events.iter().filter(|e| matches!(e, Recorded::Load { .. })).count();
        assert_eq!(loads, 1);
        assert!(!events.iter().any(|e| matches!(e, Recorded::Unload { .. })));
        assert!(cluster.loaded("triton-1").is_empty());
    }

    #[tokio::test]
    async fn test_restart_rebuilds_ledger_from_labels() {
        let log = EventLog::default();
        let cluster = MemoryCluster::new(log.clone());
        cluster.add_server("triton-0", 16 * GB);
        cluster.preload("triton-0", "DeepMET");
        let labels = MemoryLabelApi::new(log.clone());
        labels.seed("triton-0", "deepmet", LabelState::Loaded);
        let pools = MemoryPoolApi::new(log.clone());
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());

        let backends = Backends {
            directory: Arc::new(cluster.clone()),
            metrics_source: Arc::new(cluster.clone()),
            control: Arc::new(cluster.clone()),
            labels: Arc::new(labels.clone()),
            pools: Arc::new(pools.clone()),
            services: Arc::new(MemoryServiceApi::new()),
        };
        let (state, _) = start(&config(&[("DeepMET", 1024)]), store, backends, "test".into())
            .await
            .unwrap();

        assert!(state.ledger.snapshot().is_routable("triton-0", "deepmet"));
        for _ in 0..400 {
            if pools.contains("deepmet", "triton-0") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(pools.contains("deepmet", "triton-0"));
    }

    #[tokio::test]
    async fn test_identity_collision_does_not_block_startup() {
        let log = EventLog::default();
        let cluster = MemoryCluster::new(log.clone());
        cluster.add_server("triton-0", 16 * GB);
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let backends = Backends {
            directory: Arc::new(cluster.clone()),
            metrics_source: Arc::new(cluster.clone()),
            control: Arc::new(cluster.clone()),
            labels: Arc::new(MemoryLabelApi::new(log.clone())),
            pools: Arc::new(MemoryPoolApi::new(log)),
            services: Arc::new(MemoryServiceApi::new()),
        };
        let cfg = config(&[("My_Model", 1024), ("my-model", 1024), ("DeepMET", 1024)]);
        let (state, _) = start(&cfg, store, backends, "test".into()).await.unwrap();

        assert_eq!(state.registry.catalog().len(), 2);
        assert_eq!(state.conditions.count(ConditionKind::IdentityCollision), 1);
    }

    #[tokio::test]
    async fn test_model_services_are_applied_once_and_retried() {
        let log = EventLog::default();
        let cluster = MemoryCluster::new(log.clone());
        cluster.add_server("triton-0", 16 * GB);
        let services = MemoryServiceApi::new();
        services.fail_writes(1);
        let backends = Backends {
            directory: Arc::new(cluster.clone()),
            metrics_source: Arc::new(cluster.clone()),
            control: Arc::new(cluster.clone()),
            labels: Arc::new(MemoryLabelApi::new(log.clone())),
            pools: Arc::new(MemoryPoolApi::new(log)),
            services: Arc::new(services.clone()),
        };
        let cfg = config(&[("DeepMET", 1024), ("ParticleNet", 2048)]);
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let (_state, mut decisions) = start(&cfg, store, backends, "test".into()).await.unwrap();

        // the first write failed; the other model is already out
        assert_eq!(services.names().len(), 1);
        assert_eq!(services.writes(), 1);

        decisions.cycle().await.unwrap();
        decisions.cycle().await.unwrap();
        assert_eq!(
            services.names(),
            BTreeSet::from(["supersonic-deepmet".to_string(), "supersonic-particlenet".to_string()])
        );
        assert_eq!(services.writes(), 2);

        let svc = services.get("supersonic-particlenet").unwrap();
        assert_eq!(svc.selector()["model.particlenet"], "loaded");
        assert_eq!(svc.labels["app.kubernetes.io/instance"], "supersonic");
        assert_eq!(svc.ports.grpc, 8001);
    }
}
