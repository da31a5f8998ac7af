//! In-process adapters. They keep one shared, ordered log of every side
//! effect so ordering guarantees can be checked after a run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use sonic_common::{
    now_ms, ControlError, LabelState, ModelTraffic, PoolEndpoint, ServerSample, ServerTarget,
};

use super::{
    LabelApi, MetricsSource, ModelService, PoolApi, ServerControl, ServerDirectory, ServiceApi,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Load { server_id: String, model: String },
    Unload { server_id: String, model: String },
    SetLabel { server_id: String, model_id: String, state: LabelState },
    RemoveLabel { server_id: String, model_id: String },
    PoolAdd { server_id: String, model_id: String },
    PoolRemove { server_id: String, model_id: String },
}

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Recorded>>>);

impl EventLog {
    fn push(&self, event: Recorded) {
        lock(&self.0).push(event);
    }

    pub fn events(&self) -> Vec<Recorded> {
        lock(&self.0).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct FakeServer {
    address: String,
    total_bytes: u64,
    reachable: bool,
    ready: bool,
    utilization: f64,
    loaded: BTreeSet<String>,
    traffic: BTreeMap<String, ModelTraffic>,
    failing_loads: u32,
    /// Load calls block until released.
    loads_held: bool,
}

#[derive(Debug, Default)]
struct ClusterState {
    servers: BTreeMap<String, FakeServer>,
    /// model name -> bytes taken once loaded
    footprints: BTreeMap<String, u64>,
}

/// A set of simulated inference servers: directory, metrics, and control.
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
    released: Arc<Notify>,
    log: EventLog,
}

impl MemoryCluster {
    pub fn new(log: EventLog) -> Self {
        Self {
            state: Arc::default(),
            released: Arc::default(),
            log,
        }
    }

    pub fn add_server(&self, server_id: &str, total_bytes: u64) {
        let mut state = lock(&self.state);
        let address = format!("10.0.0.{}", state.servers.len() + 1);
        state.servers.insert(
            server_id.to_string(),
            FakeServer {
                address,
                total_bytes,
                reachable: true,
                ready: true,
                utilization: 0.0,
                loaded: BTreeSet::new(),
                traffic: BTreeMap::new(),
                failing_loads: 0,
                loads_held: false,
            },
        );
    }

    pub fn remove_server(&self, server_id: &str) {
        lock(&self.state).servers.remove(server_id);
    }

    pub fn set_footprint(&self, model: &str, bytes: u64) {
        lock(&self.state).footprints.insert(model.to_string(), bytes);
    }

    pub fn set_reachable(&self, server_id: &str, reachable: bool) {
        if let Some(s) = lock(&self.state).servers.get_mut(server_id) {
            s.reachable = reachable;
        }
    }

    pub fn set_traffic(&self, server_id: &str, model: &str, traffic: ModelTraffic) {
        if let Some(s) = lock(&self.state).servers.get_mut(server_id) {
            s.traffic.insert(model.to_string(), traffic);
        }
    }

    pub fn set_utilization(&self, server_id: &str, utilization: f64) {
        if let Some(s) = lock(&self.state).servers.get_mut(server_id) {
            s.utilization = utilization;
        }
    }

    /// Make the next `n` load calls on the server fail with a transient error.
    pub fn fail_loads(&self, server_id: &str, n: u32) {
        if let Some(s) = lock(&self.state).servers.get_mut(server_id) {
            s.failing_loads = n;
        }
    }

    /// Block load calls on the server until called again with `false`.
    pub fn hold_loads(&self, server_id: &str, held: bool) {
        if let Some(s) = lock(&self.state).servers.get_mut(server_id) {
            s.loads_held = held;
        }
        if !held {
            self.released.notify_waiters();
        }
    }

    /// Pretend a model is already resident, without going through load.
    pub fn preload(&self, server_id: &str, model: &str) {
        if let Some(s) = lock(&self.state).servers.get_mut(server_id) {
            s.loaded.insert(model.to_string());
        }
    }

    pub fn loaded(&self, server_id: &str) -> BTreeSet<String> {
        lock(&self.state)
            .servers
            .get(server_id)
            .map(|s| s.loaded.clone())
            .unwrap_or_default()
    }

    pub fn target(&self, server_id: &str) -> Option<ServerTarget> {
        lock(&self.state).servers.get(server_id).map(|s| ServerTarget {
            server_id: server_id.to_string(),
            address: s.address.clone(),
        })
    }

    pub fn capacity(&self, server_id: &str) -> Option<u64> {
        lock(&self.state).servers.get(server_id).map(|s| s.total_bytes)
    }

    pub fn targets(&self) -> Vec<ServerTarget> {
        lock(&self.state)
            .servers
            .iter()
            .map(|(id, s)| ServerTarget {
                server_id: id.clone(),
                address: s.address.clone(),
            })
            .collect()
    }

    fn reachable(&self, server_id: &str) -> Result<(), ControlError> {
        match lock(&self.state).servers.get(server_id) {
            Some(s) if s.reachable => Ok(()),
            Some(_) => Err(ControlError::Transport(format!("{server_id} unreachable"))),
            None => Err(ControlError::NotFound(server_id.to_string())),
        }
    }
}

#[async_trait]
impl ServerDirectory for MemoryCluster {
    async fn list_servers(&self) -> Result<Vec<ServerTarget>, ControlError> {
        Ok(self.targets())
    }
}

#[async_trait]
impl MetricsSource for MemoryCluster {
    async fn sample(&self, server: &ServerTarget) -> Result<ServerSample, ControlError> {
        self.reachable(&server.server_id)?;
        let state = lock(&self.state);
        let s = state
            .servers
            .get(&server.server_id)
            .ok_or_else(|| ControlError::NotFound(server.server_id.clone()))?;
        let used: u64 = s
            .loaded
            .iter()
            .map(|m| state.footprints.get(m).copied().unwrap_or(0))
            .sum();
        let traffic = s
            .traffic
            .iter()
            .filter(|(m, _)| s.loaded.contains(*m))
            .map(|(m, t)| (m.clone(), *t))
            .collect();
        Ok(ServerSample {
            gpu_memory_total_bytes: s.total_bytes,
            gpu_memory_used_bytes: used,
            gpu_utilization: s.utilization,
            ready: s.ready,
            traffic,
            observed_at_ms: now_ms(),
        })
    }
}

#[async_trait]
impl ServerControl for MemoryCluster {
    async fn load_model(&self, server: &ServerTarget, model_name: &str) -> Result<(), ControlError> {
        self.reachable(&server.server_id)?;
        loop {
            let released = self.released.notified();
            let held = lock(&self.state)
                .servers
                .get(&server.server_id)
                .is_some_and(|s| s.loads_held);
            if !held {
                break;
            }
            released.await;
        }
        let mut state = lock(&self.state);
        let s = state
            .servers
            .get_mut(&server.server_id)
            .ok_or_else(|| ControlError::NotFound(server.server_id.clone()))?;
        if s.failing_loads > 0 {
            s.failing_loads -= 1;
            return Err(ControlError::Rejected {
                status: 503,
                message: "load failed".into(),
            });
        }
        s.loaded.insert(model_name.to_string());
        drop(state);
        self.log.push(Recorded::Load {
            server_id: server.server_id.clone(),
            model: model_name.to_string(),
        });
        Ok(())
    }

    async fn unload_model(&self, server: &ServerTarget, model_name: &str) -> Result<(), ControlError> {
        self.reachable(&server.server_id)?;
        if let Some(s) = lock(&self.state).servers.get_mut(&server.server_id) {
            s.loaded.remove(model_name);
        }
        self.log.push(Recorded::Unload {
            server_id: server.server_id.clone(),
            model: model_name.to_string(),
        });
        Ok(())
    }

    async fn ready_models(&self, server: &ServerTarget) -> Result<BTreeSet<String>, ControlError> {
        self.reachable(&server.server_id)?;
        Ok(self.loaded(&server.server_id))
    }
}

/// Pod labels kept in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryLabelApi {
    labels: Arc<Mutex<BTreeMap<String, BTreeMap<String, LabelState>>>>,
    log: EventLog,
}

impl MemoryLabelApi {
    pub fn new(log: EventLog) -> Self {
        Self {
            labels: Arc::default(),
            log,
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, LabelState>> {
        lock(&self.labels).clone()
    }

    /// Seed a label as if written by an earlier controller run.
    pub fn seed(&self, server_id: &str, model_id: &str, state: LabelState) {
        lock(&self.labels)
            .entry(server_id.to_string())
            .or_default()
            .insert(model_id.to_string(), state);
    }
}

#[async_trait]
impl LabelApi for MemoryLabelApi {
    async fn set_model_label(
        &self,
        server_id: &str,
        model_id: &str,
        state: LabelState,
    ) -> Result<(), ControlError> {
        self.seed(server_id, model_id, state);
        self.log.push(Recorded::SetLabel {
            server_id: server_id.to_string(),
            model_id: model_id.to_string(),
            state,
        });
        Ok(())
    }

    async fn remove_model_label(&self, server_id: &str, model_id: &str) -> Result<(), ControlError> {
        if let Some(models) = lock(&self.labels).get_mut(server_id) {
            models.remove(model_id);
        }
        self.log.push(Recorded::RemoveLabel {
            server_id: server_id.to_string(),
            model_id: model_id.to_string(),
        });
        Ok(())
    }

    async fn model_labels(&self, server_id: &str) -> Result<BTreeMap<String, LabelState>, ControlError> {
        Ok(lock(&self.labels).get(server_id).cloned().unwrap_or_default())
    }
}

/// Address pools kept in memory, with injectable write failures.
#[derive(Debug, Clone, Default)]
pub struct MemoryPoolApi {
    endpoints: Arc<Mutex<BTreeMap<(String, String), PoolEndpoint>>>,
    failing_writes: Arc<Mutex<u32>>,
    log: EventLog,
}

impl MemoryPoolApi {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    pub fn fail_writes(&self, n: u32) {
        *lock(&self.failing_writes) = n;
    }

    /// Insert an endpoint behind the controller's back.
    pub fn inject(&self, endpoint: PoolEndpoint) {
        lock(&self.endpoints).insert((endpoint.model_id.clone(), endpoint.server_id.clone()), endpoint);
    }

    pub fn contains(&self, model_id: &str, server_id: &str) -> bool {
        lock(&self.endpoints).contains_key(&(model_id.to_string(), server_id.to_string()))
    }

    pub fn members(&self) -> BTreeSet<(String, String)> {
        lock(&self.endpoints).keys().cloned().collect()
    }

    fn check_write(&self) -> Result<(), ControlError> {
        let mut failing = lock(&self.failing_writes);
        if *failing > 0 {
            *failing -= 1;
            return Err(ControlError::Transport("pool store unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PoolApi for MemoryPoolApi {
    async fn add_endpoint(&self, endpoint: &PoolEndpoint) -> Result<(), ControlError> {
        self.check_write()?;
        self.inject(endpoint.clone());
        self.log.push(Recorded::PoolAdd {
            server_id: endpoint.server_id.clone(),
            model_id: endpoint.model_id.clone(),
        });
        Ok(())
    }

    async fn remove_endpoint(&self, model_id: &str, server_id: &str) -> Result<(), ControlError> {
        self.check_write()?;
        lock(&self.endpoints).remove(&(model_id.to_string(), server_id.to_string()));
        self.log.push(Recorded::PoolRemove {
            server_id: server_id.to_string(),
            model_id: model_id.to_string(),
        });
        Ok(())
    }

    async fn list_endpoints(&self) -> Result<Vec<PoolEndpoint>, ControlError> {
        Ok(lock(&self.endpoints).values().cloned().collect())
    }
}

/// Per-model services kept in memory, with injectable write failures.
#[derive(Debug, Clone, Default)]
pub struct MemoryServiceApi {
    services: Arc<Mutex<BTreeMap<String, ModelService>>>,
    writes: Arc<Mutex<u32>>,
    failing_writes: Arc<Mutex<u32>>,
}

impl MemoryServiceApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, n: u32) {
        *lock(&self.failing_writes) = n;
    }

    pub fn get(&self, name: &str) -> Option<ModelService> {
        lock(&self.services).get(name).cloned()
    }

    pub fn names(&self) -> BTreeSet<String> {
        lock(&self.services).keys().cloned().collect()
    }

    /// Successful writes so far, repeats included.
    pub fn writes(&self) -> u32 {
        *lock(&self.writes)
    }
}

#[async_trait]
impl ServiceApi for MemoryServiceApi {
    async fn ensure_service(&self, service: &ModelService) -> Result<(), ControlError> {
        {
            let mut failing = lock(&self.failing_writes);
            if *failing > 0 {
                *failing -= 1;
                return Err(ControlError::Transport("api server unavailable".into()));
            }
        }
        lock(&self.services).insert(service.name.clone(), service.clone());
        *lock(&self.writes) += 1;
        Ok(())
    }
}
