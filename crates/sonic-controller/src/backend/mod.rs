//! Seams to the outside world: inference servers, pod labels, address pools,
//! per-model services, and server discovery.

pub mod kube;
#[cfg(test)]
pub mod memory;
pub mod pools;
pub mod triton;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use sonic_common::{
    model_label_key, ControlError, LabelState, PoolEndpoint, ServerSample, ServerTarget,
};

use crate::config::PortConfig;

/// Enumerates the servers in the deployment.
#[async_trait]
pub trait ServerDirectory: Send + Sync {
    async fn list_servers(&self) -> Result<Vec<ServerTarget>, ControlError>;
}

/// Reads resource usage and traffic from a server.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn sample(&self, server: &ServerTarget) -> Result<ServerSample, ControlError>;
}

/// Load/unload control of an inference server, addressed by model name.
#[async_trait]
pub trait ServerControl: Send + Sync {
    async fn load_model(&self, server: &ServerTarget, model_name: &str) -> Result<(), ControlError>;
    async fn unload_model(&self, server: &ServerTarget, model_name: &str) -> Result<(), ControlError>;
    /// Names of models the server reports ready.
    async fn ready_models(&self, server: &ServerTarget) -> Result<BTreeSet<String>, ControlError>;
}

/// Per-server `model.<id>` labels, the authoritative committed state.
#[async_trait]
pub trait LabelApi: Send + Sync {
    async fn set_model_label(
        &self,
        server_id: &str,
        model_id: &str,
        state: LabelState,
    ) -> Result<(), ControlError>;
    async fn remove_model_label(&self, server_id: &str, model_id: &str) -> Result<(), ControlError>;
    /// model_id -> label state. Labels with unknown values are skipped.
    async fn model_labels(&self, server_id: &str) -> Result<BTreeMap<String, LabelState>, ControlError>;
}

/// Address pools consumed by load balancers. Writes must be idempotent.
#[async_trait]
pub trait PoolApi: Send + Sync {
    async fn add_endpoint(&self, endpoint: &PoolEndpoint) -> Result<(), ControlError>;
    async fn remove_endpoint(&self, model_id: &str, server_id: &str) -> Result<(), ControlError>;
    async fn list_endpoints(&self) -> Result<Vec<PoolEndpoint>, ControlError>;
}

/// Headless service in front of every server where a model is routable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelService {
    /// `<release>-<model_id>`
    pub name: String,
    pub release_name: String,
    pub model_id: String,
    /// Labels every server pod of the deployment carries.
    pub labels: BTreeMap<String, String>,
    pub ports: PortConfig,
}

impl ModelService {
    /// Deployment labels plus the model's `loaded` label; draining pods drop out.
    pub fn selector(&self) -> BTreeMap<String, String> {
        let mut selector = self.labels.clone();
        selector.insert(model_label_key(&self.model_id), LabelState::Loaded.as_str().to_string());
        selector
    }
}

/// Creates or updates per-model services. Must be idempotent.
#[async_trait]
pub trait ServiceApi: Send + Sync {
    async fn ensure_service(&self, service: &ModelService) -> Result<(), ControlError>;
}

/// Fixed server list from the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    servers: Vec<ServerTarget>,
}

impl StaticDirectory {
    pub fn new(servers: Vec<ServerTarget>) -> Self {
        Self { servers }
    }
}

#[async_trait]
impl ServerDirectory for StaticDirectory {
    async fn list_servers(&self) -> Result<Vec<ServerTarget>, ControlError> {
        Ok(self.servers.clone())
    }
}
