use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use sonic_common::{ModelConfig, ServerTarget};

use crate::backend::ModelService;
use crate::observer::ObserverPolicy;
use crate::planner::PlannerPolicy;
use crate::pool_sync::PoolSyncPolicy;
use crate::reconcile::ReconcilePolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub http: u16,
    pub grpc: u16,
    pub metrics: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            http: 8000,
            grpc: 8001,
            metrics: 8002,
        }
    }
}

/// Controller configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Helm release that owns the Triton deployment.
    pub release_name: String,
    pub namespace: String,
    /// Pod label selector; derived from `release_name` when unset.
    pub server_selector: Option<String>,
    /// Fixed server list, used instead of pod discovery when non-empty.
    pub servers: Vec<ServerTarget>,
    pub ports: PortConfig,
    /// Upper bound for a single Triton HTTP call.
    pub request_timeout_ms: u64,
    pub models: Vec<ModelConfig>,
    pub decision_interval_ms: u64,
    pub planner: PlannerPolicy,
    pub reconcile: ReconcilePolicy,
    pub observer: ObserverPolicy,
    pub pool_sync: PoolSyncPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            release_name: "supersonic".to_string(),
            namespace: "default".to_string(),
            server_selector: None,
            servers: Vec::new(),
            ports: PortConfig::default(),
            request_timeout_ms: 30_000,
            models: Vec::new(),
            decision_interval_ms: 10_000,
            planner: PlannerPolicy::default(),
            reconcile: ReconcilePolicy::default(),
            observer: ObserverPolicy::default(),
            pool_sync: PoolSyncPolicy::default(),
        }
    }
}

impl ControllerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut cfg = Self::from_yaml(&raw)?;
        // the bridge publishes the same ports the servers listen on
        cfg.pool_sync.http_port = cfg.ports.http;
        cfg.pool_sync.grpc_port = cfg.ports.grpc;
        Ok(cfg)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(raw).context("invalid controller config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for model in &self.models {
            if model.name.trim().is_empty() {
                bail!("model with an empty name");
            }
            if !names.insert(model.name.as_str()) {
                bail!("model {} listed twice", model.name);
            }
            if let Some(max) = model.max_replicas {
                if max < model.min_replicas {
                    bail!(
                        "model {}: max_replicas {} below min_replicas {}",
                        model.name,
                        max,
                        model.min_replicas
                    );
                }
            }
        }
        if self.decision_interval_ms == 0 || self.observer.poll_interval_ms == 0 {
            bail!("decision and poll intervals must be positive");
        }
        if self.reconcile.max_parallel_servers == 0 {
            bail!("reconcile.max_parallel_servers must be at least 1");
        }
        let multiplier = self.reconcile.retry.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            bail!("reconcile.retry.backoff_multiplier must be a finite number of at least 1, got {multiplier}");
        }
        if self.pool_sync.resync_interval_ms == 0 {
            bail!("pool_sync.resync_interval_ms must be positive");
        }
        if self.pool_sync.channel_capacity == 0 {
            bail!("pool_sync.channel_capacity must be at least 1");
        }
        Ok(())
    }

    pub fn selector(&self) -> String {
        match &self.server_selector {
            Some(s) => s.clone(),
            None => format!(
                "app.kubernetes.io/name=supersonic,app.kubernetes.io/instance={},app.kubernetes.io/component=triton",
                self.release_name
            ),
        }
    }

    /// Equality terms of the selector; set-based and negated terms are skipped.
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        self.selector()
            .split(',')
            .filter_map(|term| {
                let (key, value) = term.split_once('=')?;
                if key.ends_with('!') {
                    return None;
                }
                let value = value.strip_prefix('=').unwrap_or(value);
                let key = key.trim();
                (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
            })
            .collect()
    }

    pub fn model_service(&self, model_id: &str) -> ModelService {
        ModelService {
            name: format!("{}-{}", self.release_name, model_id),
            release_name: self.release_name.clone(),
            model_id: model_id.to_string(),
            labels: self.selector_labels(),
            ports: self.ports.clone(),
        }
    }
}
