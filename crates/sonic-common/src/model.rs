use serde::{Deserialize, Serialize};

const MB: u64 = 1024 * 1024;

/// A model entry as written in the controller config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelConfig {
    /// Canonical model name, as the inference server knows it (e.g. "deepmet-v1").
    pub name: String,

    /// Estimated GPU memory needed once loaded.
    pub memory_footprint_mb: u64,

    #[serde(default = "default_min_replicas")]
    pub min_replicas: u32,

    /// `None` means bounded only by the number of servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<u32>,

    /// Higher values are placed first when capacity is scarce.
    #[serde(default)]
    pub priority: i32,
}

fn default_min_replicas() -> u32 {
    1
}

/// Registered model identity plus its scheduling parameters.
///
/// `model_id` is issued by the identity registry and never changes for the
/// lifetime of the registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub model_id: String,
    pub memory_footprint_bytes: u64,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub priority: i32,
}

impl ModelSpec {
    pub fn from_config(cfg: &ModelConfig, model_id: String) -> Self {
        let max_replicas = cfg.max_replicas.unwrap_or(u32::MAX).max(cfg.min_replicas);
        Self {
            name: cfg.name.clone(),
            model_id,
            memory_footprint_bytes: cfg.memory_footprint_mb.saturating_mul(MB),
            min_replicas: cfg.min_replicas,
            max_replicas,
            priority: cfg.priority,
        }
    }

    /// Footprint estimates may be refreshed from observation; everything else
    /// stays fixed while the model is registered.
    pub fn with_footprint(mut self, bytes: u64) -> Self {
        self.memory_footprint_bytes = bytes;
        self
    }
}
