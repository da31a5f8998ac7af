use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use sonic_common::{
    now_ms, AddressPool, CommittedPlacement, ConditionKind, ControlError, Epoch, LabelState, PlacementError,
    PoolEndpoint, PoolEvent, PoolEventKind,
};

use crate::backend::PoolApi;
use crate::conditions::ConditionBoard;
use crate::metrics::SharedMetrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSyncPolicy {
    pub http_port: u16,
    pub grpc_port: u16,
    /// Full recomputation from the ledger, regardless of events.
    pub resync_interval_ms: u64,
    /// Delay before re-attempting writes that failed.
    pub retry_delay_ms: u64,
    pub channel_capacity: usize,
}

impl Default for PoolSyncPolicy {
    fn default() -> Self {
        Self {
            http_port: 8000,
            grpc_port: 8001,
            resync_interval_ms: 60_000,
            retry_delay_ms: 1_000,
            channel_capacity: 1024,
        }
    }
}

/// model_id -> pool, as last written by the bridge.
pub type PoolView = BTreeMap<String, AddressPool>;

type Pair = (String, String);
type OrderingKey = (Epoch, u64);

pub enum PoolCommand {
    Apply {
        event: PoolEvent,
        /// Fires once the pool reflects the event.
        ack: Option<oneshot::Sender<()>>,
    },
}

/// Sending half used by the reconciler.
#[derive(Clone)]
pub struct PoolSyncHandle {
    tx: mpsc::Sender<PoolCommand>,
}

impl PoolSyncHandle {
    pub async fn publish(&self, event: PoolEvent) -> Result<(), ControlError> {
        self.tx
            .send(PoolCommand::Apply { event, ack: None })
            .await
            .map_err(|_| ControlError::Backend("pool sync bridge stopped".into()))
    }

    /// Publish and wait until the pool reflects the event.
    pub async fn publish_confirmed(&self, event: PoolEvent, timeout: Duration) -> Result<(), ControlError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Apply {
                event,
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| ControlError::Backend("pool sync bridge stopped".into()))?;
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ControlError::Backend("pool event superseded before it was applied".into())),
            Err(_) => Err(ControlError::Timeout(timeout.as_millis() as u64)),
        }
    }
}

struct Pending {
    event: PoolEvent,
    acks: Vec<oneshot::Sender<()>>,
}

/// Mirrors committed label transitions into address pools.
///
/// Per (model, server) pair, events are applied in ordering-key order and an
/// event older than the last applied one is dropped. Failed writes stay
/// pending and are retried, so every accepted event is applied at least once.
pub struct PoolSyncBridge {
    api: Arc<dyn PoolApi>,
    ledger: watch::Receiver<Arc<CommittedPlacement>>,
    rx: mpsc::Receiver<PoolCommand>,
    conditions: Arc<ConditionBoard>,
    metrics: Arc<SharedMetrics>,
    policy: PoolSyncPolicy,
    applied: HashMap<Pair, (OrderingKey, PoolEventKind)>,
    pending: BTreeMap<Pair, Pending>,
    view: PoolView,
    view_tx: watch::Sender<Arc<PoolView>>,
    /// server_id -> address, learned from add events
    addresses: HashMap<String, String>,
}

impl PoolSyncBridge {
    pub fn new(
        api: Arc<dyn PoolApi>,
        ledger: watch::Receiver<Arc<CommittedPlacement>>,
        conditions: Arc<ConditionBoard>,
        metrics: Arc<SharedMetrics>,
        policy: PoolSyncPolicy,
    ) -> (Self, PoolSyncHandle, watch::Receiver<Arc<PoolView>>) {
        let (tx, rx) = mpsc::channel(policy.channel_capacity.max(1));
        let (view_tx, view_rx) = watch::channel(Arc::new(PoolView::new()));
        let bridge = Self {
            api,
            ledger,
            rx,
            conditions,
            metrics,
            policy,
            applied: HashMap::new(),
            pending: BTreeMap::new(),
            view: PoolView::new(),
            view_tx,
            addresses: HashMap::new(),
        };
        (bridge, PoolSyncHandle { tx }, view_rx)
    }

    pub async fn run(mut self) {
        let mut resync = tokio::time::interval(Duration::from_millis(self.policy.resync_interval_ms));
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let retry_delay = Duration::from_millis(self.policy.retry_delay_ms);
        info!(resync_interval_ms = self.policy.resync_interval_ms, "pool sync bridge started");

        loop {
            if self.pending.is_empty() {
                tokio::select! {
                    cmd = self.rx.recv() => match cmd {
                        Some(cmd) => self.handle(cmd).await,
                        None => break,
                    },
                    _ = resync.tick() => self.resync().await,
                }
            } else {
                tokio::select! {
                    cmd = self.rx.recv() => match cmd {
                        Some(cmd) => self.handle(cmd).await,
                        None => break,
                    },
                    _ = tokio::time::sleep(retry_delay) => {}
                }
            }
            self.drain_ready().await;
            self.flush().await;
        }
        info!("pool sync bridge stopped");
    }

    /// Take whatever is already queued without waiting.
    async fn drain_ready(&mut self) {
        while let Ok(cmd) = self.rx.try_recv() {
            self.handle(cmd).await;
        }
    }

    async fn handle(&mut self, cmd: PoolCommand) {
        match cmd {
            PoolCommand::Apply { event, ack } => self.accept(event, ack),
        }
    }

    fn accept(&mut self, event: PoolEvent, ack: Option<oneshot::Sender<()>>) {
        let pair = event.pair();
        let key = event.ordering_key();
        let applied = self.applied.get(&pair).copied();
        if event.kind == PoolEventKind::Add && !event.address.is_empty() {
            self.addresses.insert(event.server_id.clone(), event.address.clone());
        }

        if let Some((applied_key, applied_kind)) = applied {
            if key < applied_key {
                SharedMetrics::inc(&self.metrics.pool_events_stale_total);
                let err = PlacementError::PoolSyncStale {
                    model_id: event.model_id.clone(),
                    server_id: event.server_id.clone(),
                    epoch: event.epoch,
                    seq: event.seq,
                    applied_epoch: applied_key.0,
                    applied_seq: applied_key.1,
                };
                warn!(%err, "discarding stale pool event");
                self.conditions.report(&err);
                // the pool already says what this event wanted
                if applied_kind == event.kind {
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
                return;
            }
            if key == applied_key && applied_kind == event.kind && !self.pending.contains_key(&pair) {
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                return;
            }
        }

        match self.pending.get_mut(&pair) {
            Some(p) if key < p.event.ordering_key() => {
                SharedMetrics::inc(&self.metrics.pool_events_stale_total);
                debug!(model_id = %event.model_id, server_id = %event.server_id, "older than queued event, dropping");
                if p.event.kind == event.kind {
                    if let Some(ack) = ack {
                        p.acks.push(ack);
                    }
                }
            }
            Some(p) => {
                // acks for the opposite transition can no longer be honoured
                if p.event.kind != event.kind {
                    p.acks.clear();
                }
                p.event = event;
                p.acks.extend(ack);
            }
            None => {
                self.pending.insert(
                    pair,
                    Pending {
                        event,
                        acks: ack.into_iter().collect(),
                    },
                );
            }
        }
    }

    async fn flush(&mut self) {
        let pairs: Vec<Pair> = self.pending.keys().cloned().collect();
        let mut changed = false;
        for pair in pairs {
            let Some(p) = self.pending.get(&pair) else {
                continue;
            };
            let event = p.event.clone();
            let result = match event.kind {
                PoolEventKind::Add => self.api.add_endpoint(&self.endpoint(&event)).await,
                PoolEventKind::Remove => self.api.remove_endpoint(&event.model_id, &event.server_id).await,
            };
            match result {
                Ok(()) => {
                    SharedMetrics::inc(&self.metrics.pool_events_applied_total);
                    self.applied.insert(pair.clone(), (event.ordering_key(), event.kind));
                    self.conditions.resolve(
                        ConditionKind::PoolSyncStale,
                        Some(&event.server_id),
                        Some(&event.model_id),
                    );
                    self.apply_to_view(&event);
                    changed = true;
                    if let Some(p) = self.pending.remove(&pair) {
                        for ack in p.acks {
                            let _ = ack.send(());
                        }
                    }
                    debug!(
                        kind = ?event.kind,
                        model_id = %event.model_id,
                        server_id = %event.server_id,
                        epoch = event.epoch,
                        seq = event.seq,
                        "pool event applied"
                    );
                }
                Err(e) => {
                    SharedMetrics::inc(&self.metrics.pool_apply_errors_total);
                    warn!(
                        model_id = %event.model_id,
                        server_id = %event.server_id,
                        error = %e,
                        "pool write failed, will retry"
                    );
                }
            }
        }
        if changed {
            self.view_tx.send_replace(Arc::new(self.view.clone()));
        }
    }

    fn endpoint(&self, event: &PoolEvent) -> PoolEndpoint {
        PoolEndpoint {
            model_id: event.model_id.clone(),
            server_id: event.server_id.clone(),
            address: event.address.clone(),
            http_port: self.policy.http_port,
            grpc_port: self.policy.grpc_port,
            epoch: event.epoch,
            seq: event.seq,
            updated_at_ms: now_ms(),
        }
    }

    fn apply_to_view(&mut self, event: &PoolEvent) {
        match event.kind {
            PoolEventKind::Add => {
                let endpoint = self.endpoint(event);
                self.view
                    .entry(event.model_id.clone())
                    .or_insert_with(|| AddressPool::new(&event.model_id))
                    .endpoints
                    .insert(event.server_id.clone(), endpoint);
            }
            PoolEventKind::Remove => {
                if let Some(pool) = self.view.get_mut(&event.model_id) {
                    pool.endpoints.remove(&event.server_id);
                    if pool.endpoints.is_empty() {
                        self.view.remove(&event.model_id);
                    }
                }
            }
        }
    }

    /// Forget settled removals, addresses of servers the ledger no longer
    /// holds, and stale-event conditions of pairs that are gone.
    fn prune(&mut self, committed: &CommittedPlacement) {
        let pending = &self.pending;
        let known = |pair: &Pair| pending.contains_key(pair) || committed.entry(&pair.1, &pair.0).is_some();

        let before = (self.applied.len(), self.addresses.len());
        self.applied
            .retain(|pair, (_, kind)| *kind == PoolEventKind::Add || known(pair));
        self.addresses.retain(|server_id, _| {
            committed.servers.contains_key(server_id) || pending.keys().any(|(_, s)| s == server_id)
        });

        for (kind, server_id, model_id) in self.conditions.list().into_iter().map(|c| c.key()) {
            let (ConditionKind::PoolSyncStale, Some(server_id), Some(model_id)) = (kind, server_id, model_id) else {
                continue;
            };
            if !known(&(model_id.clone(), server_id.clone())) {
                self.conditions.resolve(kind, Some(&server_id), Some(&model_id));
            }
        }

        let after = (self.applied.len(), self.addresses.len());
        if after != before {
            debug!(
                applied = after.0,
                addresses = after.1,
                "pruned pool bookkeeping"
            );
        }
    }

    /// Recompute every pool from the ledger's routable set and queue the
    /// corrections. Pairs with a queued event are left to that event.
    async fn resync(&mut self) {
        SharedMetrics::inc(&self.metrics.pool_resyncs_total);
        let actual = match self.api.list_endpoints().await {
            Ok(eps) => eps,
            Err(e) => {
                warn!(error = %e, "failed to list pools, skipping resync");
                return;
            }
        };
        let committed = self.ledger.borrow().clone();
        self.prune(&committed);

        let mut desired: BTreeMap<Pair, PoolEvent> = BTreeMap::new();
        for (server_id, models) in &committed.servers {
            for (model_id, entry) in models {
                if entry.state != LabelState::Loaded {
                    continue;
                }
                desired.insert(
                    (model_id.clone(), server_id.clone()),
                    PoolEvent {
                        kind: PoolEventKind::Add,
                        model_id: model_id.clone(),
                        server_id: server_id.clone(),
                        address: String::new(),
                        epoch: entry.epoch,
                        seq: entry.seq,
                    },
                );
            }
        }

        let mut view = PoolView::new();
        let mut corrections = Vec::new();
        for ep in actual {
            let pair = (ep.model_id.clone(), ep.server_id.clone());
            if let Some(mut add) = desired.remove(&pair) {
                add.address = ep.address.clone();
                if (ep.epoch, ep.seq) < add.ordering_key() {
                    corrections.push(add);
                }
                view.entry(ep.model_id.clone())
                    .or_insert_with(|| AddressPool::new(&ep.model_id))
                    .endpoints
                    .insert(ep.server_id.clone(), ep);
            } else {
                let applied = self.applied.get(&pair).map(|(k, _)| *k);
                let key = applied.unwrap_or((ep.epoch, ep.seq)).max((ep.epoch, ep.seq));
                info!(model_id = %ep.model_id, server_id = %ep.server_id, "endpoint has no committed label, removing");
                corrections.push(PoolEvent {
                    kind: PoolEventKind::Remove,
                    model_id: ep.model_id.clone(),
                    server_id: ep.server_id.clone(),
                    address: ep.address.clone(),
                    epoch: key.0,
                    seq: key.1,
                });
                view.entry(ep.model_id.clone())
                    .or_insert_with(|| AddressPool::new(&ep.model_id))
                    .endpoints
                    .insert(ep.server_id.clone(), ep);
            }
        }

        for (_, mut add) in desired {
            let Some(address) = self.addresses.get(&add.server_id) else {
                warn!(model_id = %add.model_id, server_id = %add.server_id, "no known address for routable pair");
                continue;
            };
            add.address = address.clone();
            info!(model_id = %add.model_id, server_id = %add.server_id, "routable pair missing from pool, adding");
            corrections.push(add);
        }

        self.view = view;
        self.view_tx.send_replace(Arc::new(self.view.clone()));

        for event in corrections {
            let pair = event.pair();
            if self.pending.contains_key(&pair) {
                continue;
            }
            // the stored pool disagrees with what we last applied; rewrite it
            self.applied.remove(&pair);
            self.accept(event, None);
        }
    }
}
