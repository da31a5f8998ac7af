use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sonic_common::{
    Action, ClusterSnapshot, CommittedEntry, CommittedPlacement, ControlError, Epoch, LabelState,
    PlacementDecision, PlacementError, PoolEvent, PoolEventKind, ReconciliationTask, ServerTarget,
};

use crate::backend::{LabelApi, ServerControl};
use crate::conditions::ConditionBoard;
use crate::ledger::CommittedLedger;
use crate::metrics::SharedMetrics;
use crate::pool_sync::PoolSyncHandle;
use crate::registry::IdentityRegistry;
use crate::retry::{retry_with_backoff, RetryPolicy};

const TASK_HISTORY: usize = 512;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilePolicy {
    pub retry: RetryPolicy,
    /// Servers allowed to run a task at the same time.
    pub max_parallel_servers: usize,
    /// How long an unload waits for the pool to confirm the removal.
    pub pool_ack_timeout_ms: u64,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_parallel_servers: 8,
            pool_ack_timeout_ms: 10_000,
        }
    }
}

/// Desired state of one server for one epoch.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub epoch: Epoch,
    pub server: ServerTarget,
    pub target: BTreeSet<String>,
    pub capacity_bytes: u64,
    /// The server left the deployment; withdraw it and stop.
    pub retire: bool,
}

/// Bounded log of finished tasks, shared with the status surface.
#[derive(Debug, Clone, Default)]
pub struct TaskHistory(Arc<Mutex<VecDeque<ReconciliationTask>>>);

impl TaskHistory {
    /// Most recent tasks, oldest first.
    pub fn recent(&self) -> Vec<ReconciliationTask> {
        lock(&self.0).iter().cloned().collect()
    }

    fn push(&self, task: ReconciliationTask) {
        let mut tasks = lock(&self.0);
        if tasks.len() == TASK_HISTORY {
            tasks.pop_front();
        }
        tasks.push_back(task);
    }
}

enum TaskOutcome {
    Committed,
    AlreadySatisfied,
    Failed { error: ControlError, freeze: bool },
}

struct Shared {
    control: Arc<dyn ServerControl>,
    labels: Arc<dyn LabelApi>,
    ledger: Arc<CommittedLedger>,
    pools: PoolSyncHandle,
    registry: Arc<IdentityRegistry>,
    conditions: Arc<ConditionBoard>,
    metrics: Arc<SharedMetrics>,
    policy: ReconcilePolicy,
    permits: Semaphore,
    history: TaskHistory,
    /// server_id -> (epoch, loads handed out and not finished yet)
    pending: Mutex<BTreeMap<String, (Epoch, BTreeSet<String>)>>,
    /// server_id -> last epoch the server fully converged to
    progress: watch::Sender<BTreeMap<String, Epoch>>,
}

struct Worker {
    tx: watch::Sender<Assignment>,
    join: JoinHandle<()>,
    retiring: bool,
}

/// Drives servers toward the latest decision, one worker per server.
///
/// A worker runs its tasks strictly one at a time. When a newer assignment
/// arrives, the task in flight finishes and the rest of the old task list is
/// dropped in favour of a fresh diff against the new target.
pub struct Reconciler {
    shared: Arc<Shared>,
    workers: HashMap<String, Worker>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        control: Arc<dyn ServerControl>,
        labels: Arc<dyn LabelApi>,
        ledger: Arc<CommittedLedger>,
        pools: PoolSyncHandle,
        registry: Arc<IdentityRegistry>,
        conditions: Arc<ConditionBoard>,
        metrics: Arc<SharedMetrics>,
        policy: ReconcilePolicy,
    ) -> Self {
        let (progress, _) = watch::channel(BTreeMap::new());
        let permits = Semaphore::new(policy.max_parallel_servers.max(1));
        Self {
            shared: Arc::new(Shared {
                control,
                labels,
                ledger,
                pools,
                registry,
                conditions,
                metrics,
                policy,
                permits,
                history: TaskHistory::default(),
                pending: Mutex::new(BTreeMap::new()),
                progress,
            }),
            workers: HashMap::new(),
        }
    }

    pub fn progress(&self) -> watch::Receiver<BTreeMap<String, Epoch>> {
        self.shared.progress.subscribe()
    }

    pub fn history(&self) -> TaskHistory {
        self.shared.history.clone()
    }

    /// server_id -> models whose load was handed to a worker and has neither
    /// committed nor failed yet.
    pub fn pending(&self) -> BTreeMap<String, BTreeSet<String>> {
        lock(&self.shared.pending)
            .iter()
            .map(|(server_id, (_, models))| (server_id.clone(), models.clone()))
            .collect()
    }

    /// Hand every server its slice of the decision. Servers no longer in the
    /// snapshot are retired.
    pub fn apply(&mut self, decision: &PlacementDecision, snapshot: &ClusterSnapshot) {
        let committed = self.shared.ledger.snapshot();
        for (server_id, target) in &decision.targets {
            let Some(server) = snapshot.server(server_id) else {
                continue;
            };
            let assignment = Assignment {
                epoch: decision.epoch,
                server: ServerTarget {
                    server_id: server_id.clone(),
                    address: server.address.clone(),
                },
                target: target.clone(),
                capacity_bytes: server.gpu_memory_total_bytes,
                retire: false,
            };
            self.shared.expect_loads(&assignment, &committed);
            self.assign(assignment);
        }

        let departed: BTreeSet<String> = committed
            .servers
            .keys()
            .chain(self.workers.keys())
            .filter(|id| snapshot.server(id).is_none())
            .cloned()
            .collect();
        for server_id in departed {
            match self.workers.get(&server_id) {
                Some(w) if w.retiring && !w.join.is_finished() => continue,
                Some(w) if w.retiring => {
                    self.workers.remove(&server_id);
                    if !committed.servers.contains_key(&server_id) {
                        continue;
                    }
                }
                _ => {}
            }
            info!(%server_id, epoch = decision.epoch, "retiring departed server");
            lock(&self.shared.pending).remove(&server_id);
            self.assign(Assignment {
                epoch: decision.epoch,
                server: ServerTarget {
                    server_id,
                    address: String::new(),
                },
                target: BTreeSet::new(),
                capacity_bytes: 0,
                retire: true,
            });
        }
    }

    fn assign(&mut self, assignment: Assignment) {
        let server_id = assignment.server.server_id.clone();
        let retiring = assignment.retire;
        if let Some(worker) = self.workers.get_mut(&server_id) {
            if !worker.join.is_finished() {
                worker.retiring = retiring;
                worker.tx.send_replace(assignment);
                return;
            }
        }
        let (tx, rx) = watch::channel(assignment);
        let shared = self.shared.clone();
        let join = tokio::spawn(run_worker(shared, server_id.clone(), rx));
        self.workers.insert(server_id, Worker { tx, join, retiring });
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_worker(shared: Arc<Shared>, server_id: String, mut rx: watch::Receiver<Assignment>) {
    debug!(%server_id, "reconcile worker started");
    loop {
        let assignment = rx.borrow_and_update().clone();
        if assignment.retire {
            shared.retire(&assignment).await;
            break;
        }
        shared.converge(&assignment, &mut rx).await;
        if rx.changed().await.is_err() {
            break;
        }
    }
    debug!(%server_id, "reconcile worker stopped");
}

impl Shared {
    fn expect_loads(&self, a: &Assignment, committed: &CommittedPlacement) {
        let server_id = a.server.server_id.as_str();
        let loads: BTreeSet<String> = a
            .target
            .iter()
            .filter(|m| !committed.is_routable(server_id, m) && !self.conditions.is_failed(server_id, m))
            .cloned()
            .collect();
        let mut pending = lock(&self.pending);
        if loads.is_empty() {
            pending.remove(server_id);
        } else {
            pending.insert(server_id.to_string(), (a.epoch, loads));
        }
    }

    fn load_finished(&self, server_id: &str, model_id: &str) {
        let mut pending = lock(&self.pending);
        if let Some((_, models)) = pending.get_mut(server_id) {
            models.remove(model_id);
            if models.is_empty() {
                pending.remove(server_id);
            }
        }
    }

    fn plan_tasks(&self, assignment: &Assignment) -> Vec<ReconciliationTask> {
        let server_id = assignment.server.server_id.as_str();
        let committed = self.ledger.snapshot();
        let current = committed.servers.get(server_id).cloned().unwrap_or_default();

        let mut tasks = Vec::new();
        for model_id in current.keys() {
            if !assignment.target.contains(model_id) {
                tasks.push(ReconciliationTask::new(server_id, model_id, Action::Unload, assignment.epoch));
            }
        }
        for model_id in &assignment.target {
            if !matches!(current.get(model_id), Some(e) if e.state == LabelState::Loaded) {
                tasks.push(ReconciliationTask::new(server_id, model_id, Action::Load, assignment.epoch));
            }
        }

        tasks.retain(|t| {
            let frozen = self.conditions.is_failed(&t.server_id, &t.model_id);
            if frozen {
                debug!(server_id = %t.server_id, model_id = %t.model_id, "pair frozen by earlier failure, skipping");
            }
            !frozen
        });
        tasks
    }

    async fn converge(&self, assignment: &Assignment, rx: &mut watch::Receiver<Assignment>) {
        let tasks = self.plan_tasks(assignment);
        let total = tasks.len();
        let server_id = assignment.server.server_id.as_str();
        if total > 0 {
            info!(%server_id, epoch = assignment.epoch, tasks = total, "reconciling server");
        }

        for (done, mut task) in tasks.into_iter().enumerate() {
            if rx.has_changed().unwrap_or(true) {
                let dropped = (total - done) as u64;
                SharedMetrics::add(&self.metrics.tasks_superseded_total, dropped);
                info!(%server_id, epoch = assignment.epoch, dropped, "newer decision arrived, dropping remaining tasks");
                return;
            }
            let Ok(_permit) = self.permits.acquire().await else {
                return;
            };

            task.start();
            let mut attempts = 0u32;
            let outcome = match task.action {
                Action::Load => self.load(assignment, &task, &mut attempts).await,
                Action::Unload => self.unload(assignment, &task, &mut attempts).await,
            };
            if task.action == Action::Load {
                self.load_finished(server_id, &task.model_id);
            }
            self.record(task, attempts, outcome);
        }

        {
            // loads skipped at planning time are not coming
            let mut pending = lock(&self.pending);
            if pending.get(server_id).is_some_and(|(epoch, _)| *epoch == assignment.epoch) {
                pending.remove(server_id);
            }
        }

        self.progress.send_modify(|p| {
            p.insert(server_id.to_string(), assignment.epoch);
        });
    }

    fn record(&self, mut task: ReconciliationTask, attempts: u32, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Committed => {
                SharedMetrics::inc(&self.metrics.tasks_committed_total);
                task.finish(true, attempts);
                info!(
                    server_id = %task.server_id,
                    model_id = %task.model_id,
                    action = %task.action,
                    epoch = task.epoch,
                    attempts,
                    "task committed"
                );
            }
            TaskOutcome::AlreadySatisfied => {
                SharedMetrics::inc(&self.metrics.tasks_noop_total);
                task.finish(true, attempts);
            }
            TaskOutcome::Failed { error, freeze } => {
                SharedMetrics::inc(&self.metrics.tasks_failed_total);
                task.finish(false, attempts);
                let err = PlacementError::ReconciliationFailed {
                    server_id: task.server_id.clone(),
                    model_id: task.model_id.clone(),
                    action: task.action,
                    attempts,
                    reason: error.to_string(),
                };
                warn!(%err, frozen = freeze, "task failed");
                if freeze {
                    self.conditions.report(&err);
                }
            }
        }
        self.history.push(task);
    }

    async fn call<T, F, Fut>(&self, operation: &str, attempts: &mut u32, op: F) -> Result<T, ControlError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ControlError>>,
    {
        let (result, n) = retry_with_backoff(&self.policy.retry, operation, op).await;
        *attempts += n;
        SharedMetrics::add(&self.metrics.adapter_retries_total, u64::from(n.saturating_sub(1)));
        result
    }

    async fn load(&self, a: &Assignment, task: &ReconciliationTask, attempts: &mut u32) -> TaskOutcome {
        match self.try_load(a, task, attempts).await {
            Ok(outcome) => outcome,
            Err(error) => {
                let freeze = !matches!(error, ControlError::AdmissionRejected(_));
                TaskOutcome::Failed { error, freeze }
            }
        }
    }

    async fn try_load(
        &self,
        a: &Assignment,
        task: &ReconciliationTask,
        attempts: &mut u32,
    ) -> Result<TaskOutcome, ControlError> {
        let server = &a.server;
        let server_id = server.server_id.as_str();
        let model_id = task.model_id.as_str();
        let name = self
            .registry
            .decode(model_id)
            .ok_or_else(|| ControlError::NotFound(format!("no model registered as {model_id}")))?;

        let committed = self.ledger.snapshot();
        let existing = committed.entry(server_id, model_id).copied();
        if matches!(existing, Some(CommittedEntry { state: LabelState::Loaded, .. })) {
            return Ok(TaskOutcome::AlreadySatisfied);
        }
        if existing.is_none() {
            self.admit(a, &committed, model_id)?;
        }

        let control = self.control.as_ref();
        let wanted = name.as_str();
        let ready = self
            .call("ready_models", attempts, || async move { control.ready_models(server).await })
            .await?;
        if !ready.contains(wanted) {
            self.call("load_model", attempts, || async move { control.load_model(server, wanted).await })
                .await?;
            self.call("verify_loaded", attempts, || async move {
                let ready = control.ready_models(server).await?;
                if ready.contains(wanted) {
                    Ok(())
                } else {
                    Err(ControlError::NotReady(format!("{wanted} on {}", server.server_id)))
                }
            })
            .await?;
        } else {
            debug!(%server_id, %model_id, "model already resident, skipping load call");
        }

        let labels = self.labels.as_ref();
        self.call("set_label", attempts, || async move {
            labels.set_model_label(server_id, model_id, LabelState::Loaded).await
        })
        .await?;

        let (epoch, seq) = self.ledger.commit(server_id, model_id, Some(LabelState::Loaded), task.epoch);
        let event = PoolEvent {
            kind: PoolEventKind::Add,
            model_id: model_id.to_string(),
            server_id: server_id.to_string(),
            address: server.address.clone(),
            epoch,
            seq,
        };
        if let Err(e) = self.pools.publish(event).await {
            // the periodic resync restores the endpoint from the ledger
            warn!(%server_id, %model_id, error = %e, "failed to publish pool add");
        }
        Ok(TaskOutcome::Committed)
    }

    /// The load must fit next to everything already loaded on the server.
    fn admit(&self, a: &Assignment, committed: &CommittedPlacement, model_id: &str) -> Result<(), ControlError> {
        let footprint = |id: &str| self.registry.spec(id).map_or(0, |s| s.memory_footprint_bytes);
        let used: u64 = committed
            .loaded_models(&a.server.server_id)
            .iter()
            .map(|m| footprint(m))
            .sum();
        let needed = footprint(model_id);
        if used.saturating_add(needed) > a.capacity_bytes {
            return Err(ControlError::AdmissionRejected(format!(
                "{model_id} needs {needed} bytes, {used} of {} already committed",
                a.capacity_bytes
            )));
        }
        Ok(())
    }

    async fn unload(&self, a: &Assignment, task: &ReconciliationTask, attempts: &mut u32) -> TaskOutcome {
        match self.try_unload(a, task, attempts).await {
            Ok(outcome) => outcome,
            Err(error) => TaskOutcome::Failed { error, freeze: true },
        }
    }

    async fn try_unload(
        &self,
        a: &Assignment,
        task: &ReconciliationTask,
        attempts: &mut u32,
    ) -> Result<TaskOutcome, ControlError> {
        let server = &a.server;
        let server_id = server.server_id.as_str();
        let model_id = task.model_id.as_str();

        let Some(entry) = self.ledger.snapshot().entry(server_id, model_id).copied() else {
            return Ok(TaskOutcome::AlreadySatisfied);
        };
        let name = self
            .registry
            .decode(model_id)
            .ok_or_else(|| ControlError::NotFound(format!("no model registered as {model_id}")))?;

        // withdraw from routing first; the model stays loaded while draining
        let labels = self.labels.as_ref();
        let mut key = (entry.epoch, entry.seq);
        if entry.state == LabelState::Loaded {
            self.call("set_label", attempts, || async move {
                labels.set_model_label(server_id, model_id, LabelState::Draining).await
            })
            .await?;
            key = self.ledger.commit(server_id, model_id, Some(LabelState::Draining), task.epoch);
        }

        self.confirm_removal(server, model_id, key, attempts).await?;

        let control = self.control.as_ref();
        let wanted = name.as_str();
        self.call("unload_model", attempts, || async move {
            match control.unload_model(server, wanted).await {
                Err(ControlError::NotFound(_)) => Ok(()),
                other => other,
            }
        })
        .await?;
        self.call("verify_unloaded", attempts, || async move {
            let ready = control.ready_models(server).await?;
            if ready.contains(wanted) {
                Err(ControlError::NotReady(format!("{wanted} still loaded on {}", server.server_id)))
            } else {
                Ok(())
            }
        })
        .await?;

        self.call("remove_label", attempts, || async move {
            labels.remove_model_label(server_id, model_id).await
        })
        .await?;
        self.ledger.commit(server_id, model_id, None, task.epoch);
        Ok(TaskOutcome::Committed)
    }

    async fn confirm_removal(
        &self,
        server: &ServerTarget,
        model_id: &str,
        key: (Epoch, u64),
        attempts: &mut u32,
    ) -> Result<(), ControlError> {
        let pools = &self.pools;
        let timeout = Duration::from_millis(self.policy.pool_ack_timeout_ms);
        self.call("pool_remove", attempts, || {
            let event = PoolEvent {
                kind: PoolEventKind::Remove,
                model_id: model_id.to_string(),
                server_id: server.server_id.clone(),
                address: server.address.clone(),
                epoch: key.0,
                seq: key.1,
            };
            async move { pools.publish_confirmed(event, timeout).await }
        })
        .await
    }

    /// Withdraw every endpoint of a departed server, then forget it. No
    /// server or label calls are made; the pod is gone.
    async fn retire(&self, a: &Assignment) {
        let server_id = a.server.server_id.as_str();
        let committed = self.ledger.snapshot();
        let models: Vec<(String, CommittedEntry)> = committed
            .servers
            .get(server_id)
            .map(|m| m.iter().map(|(id, e)| (id.clone(), *e)).collect())
            .unwrap_or_default();

        for (model_id, entry) in models {
            let key = if entry.state == LabelState::Loaded {
                self.ledger.commit(server_id, &model_id, Some(LabelState::Draining), a.epoch)
            } else {
                (entry.epoch, entry.seq)
            };
            let mut attempts = 0;
            if let Err(e) = self.confirm_removal(&a.server, &model_id, key, &mut attempts).await {
                warn!(%server_id, %model_id, error = %e, "failed to withdraw departed server from pool");
            }
        }
        self.ledger.drop_server(server_id);
        for (kind, s, m) in self
            .conditions
            .list()
            .into_iter()
            .map(|c| c.key())
            .filter(|(_, s, _)| s.as_deref() == Some(server_id))
        {
            self.conditions.resolve(kind, s.as_deref(), m.as_deref());
        }
        self.progress.send_modify(|p| {
            p.remove(server_id);
        });
        info!(%server_id, "departed server withdrawn");
    }
}

/// Rebuild committed state from the labels already on the servers.
///
/// A label whose model the server does not report as loaded is kept as
/// draining, so the normal unload path withdraws and clears it.
pub async fn rebuild_ledger(
    labels: &dyn LabelApi,
    control: &dyn ServerControl,
    registry: &IdentityRegistry,
    servers: &[ServerTarget],
) -> CommittedPlacement {
    let mut placement = CommittedPlacement::default();
    for server in servers {
        let found = match labels.model_labels(&server.server_id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(server_id = %server.server_id, error = %e, "failed to read model labels");
                continue;
            }
        };
        if found.is_empty() {
            continue;
        }
        let ready = match control.ready_models(server).await {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(server_id = %server.server_id, error = %e, "cannot verify labels against server");
                None
            }
        };

        for (model_id, state) in found {
            let resident = match (registry.decode(&model_id), &ready) {
                (Some(name), Some(ready)) => ready.contains(&name),
                _ => true,
            };
            let state = if resident {
                state
            } else {
                warn!(server_id = %server.server_id, %model_id, "label without a loaded model, scheduling cleanup");
                LabelState::Draining
            };
            placement.version += 1;
            let entry = CommittedEntry {
                state,
                epoch: 0,
                seq: placement.version,
            };
            placement
                .servers
                .entry(server.server_id.clone())
                .or_default()
                .insert(model_id, entry);
        }
    }
    info!(
        servers = placement.servers.len(),
        pairs = placement.version,
        "committed placement rebuilt from labels"
    );
    placement
}

/// Pool adds for every routable pair, used once the ledger has been rebuilt.
pub fn routable_events(placement: &CommittedPlacement, servers: &[ServerTarget]) -> Vec<PoolEvent> {
    let addresses: HashMap<&str, &str> = servers
        .iter()
        .map(|s| (s.server_id.as_str(), s.address.as_str()))
        .collect();
    let mut events = Vec::new();
    for (server_id, models) in &placement.servers {
        let Some(address) = addresses.get(server_id.as_str()) else {
            continue;
        };
        for (model_id, entry) in models {
            if entry.state != LabelState::Loaded {
                continue;
            }
            events.push(PoolEvent {
                kind: PoolEventKind::Add,
                model_id: model_id.clone(),
                server_id: server_id.clone(),
                address: address.to_string(),
                epoch: entry.epoch,
                seq: entry.seq,
            });
        }
    }
    events
}
