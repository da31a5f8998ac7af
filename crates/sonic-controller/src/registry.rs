use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, warn};

use sonic_common::{encode, ModelConfig, ModelSpec, PlacementError};
use sonic_meta::{CreateOutcome, MetaStore};

const IDENTITY_PREFIX: &str = "/sonic/identities/";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Collision(#[from] PlacementError),
    #[error("identity store: {0}")]
    Store(#[from] anyhow::Error),
}

/// Issues model identifiers and holds the registered catalog.
///
/// Every identifier ever issued is persisted as `/sonic/identities/{id}` with
/// the canonical name as value, so decoding survives restarts and config
/// removals. Issuance is create-if-absent: two names that encode alike never
/// share an identifier.
pub struct IdentityRegistry {
    store: Arc<dyn MetaStore>,
    /// id -> canonical name
    issued: DashMap<String, String>,
    /// id -> spec, for models in the current config
    catalog: DashMap<String, ModelSpec>,
}

impl IdentityRegistry {
    pub async fn load(store: Arc<dyn MetaStore>) -> anyhow::Result<Self> {
        let issued = DashMap::new();
        for (key, value, _rev) in store.list_prefix(IDENTITY_PREFIX).await? {
            let Some(id) = key.strip_prefix(IDENTITY_PREFIX) else {
                continue;
            };
            match String::from_utf8(value) {
                Ok(name) => {
                    issued.insert(id.to_string(), name);
                }
                Err(e) => warn!(%key, error = %e, "ignoring undecodable identity entry"),
            }
        }
        info!(count = issued.len(), "loaded issued model identifiers");
        Ok(Self {
            store,
            issued,
            catalog: DashMap::new(),
        })
    }

    /// Issue (or re-confirm) the identifier for `cfg.name` and add the model
    /// to the catalog.
    pub async fn register(&self, cfg: &ModelConfig) -> Result<ModelSpec, RegistryError> {
        let id = encode(&cfg.name);

        let known = self.issued.get(&id).map(|e| e.value().clone());
        let owner = match known {
            Some(owner) => owner,
            None => {
                let key = format!("{IDENTITY_PREFIX}{id}");
                match self.store.create(&key, cfg.name.as_bytes().to_vec()).await? {
                    CreateOutcome::Created(_) => {
                        info!(name = %cfg.name, model_id = %id, "issued model identifier");
                        cfg.name.clone()
                    }
                    CreateOutcome::Exists { value, .. } => String::from_utf8_lossy(&value).to_string(),
                }
            }
        };
        self.issued.insert(id.clone(), owner.clone());

        if owner != cfg.name {
            return Err(PlacementError::IdentityCollision {
                name: cfg.name.clone(),
                identifier: id,
                existing: owner,
            }
            .into());
        }

        let spec = ModelSpec::from_config(cfg, id.clone());
        self.catalog.insert(id, spec.clone());
        Ok(spec)
    }

    /// Canonical name behind an identifier.
    pub fn decode(&self, model_id: &str) -> Option<String> {
        self.issued.get(model_id).map(|e| e.value().clone())
    }

    /// Identifier of a name, if that exact name owns one.
    pub fn identifier_for(&self, name: &str) -> Option<String> {
        let id = encode(name);
        let owner = self.issued.get(&id)?;
        (owner.value() == name).then_some(id)
    }

    pub fn spec(&self, model_id: &str) -> Option<ModelSpec> {
        self.catalog.get(model_id).map(|e| e.value().clone())
    }

    /// Catalog sorted by identifier.
    pub fn catalog(&self) -> Vec<ModelSpec> {
        let mut specs: Vec<ModelSpec> = self.catalog.iter().map(|e| e.value().clone()).collect();
        specs.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        specs
    }

    /// Swap in a refreshed footprint estimate. Returns the updated spec.
    pub fn refresh_footprint(&self, model_id: &str, bytes: u64) -> Option<ModelSpec> {
        let mut entry = self.catalog.get_mut(model_id)?;
        let spec = entry.value().clone().with_footprint(bytes);
        *entry.value_mut() = spec.clone();
        Some(spec)
    }

    /// id -> name for every issued identifier.
    pub fn identities(&self) -> BTreeMap<String, String> {
        self.issued
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonic_meta::MemoryMetaStore;

    fn cfg(name: &str) -> ModelConfig {
        ModelConfig {
            name: name.into(),
            memory_footprint_mb: 1024,
            min_replicas: 1,
            max_replicas: None,
            priority: 0,
        }
    }

    #[tokio::test]
    async fn test_register_and_decode() {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let registry = IdentityRegistry::load(store).await.unwrap();

        let spec = registry.register(&cfg("my model/v1.0")).await.unwrap();
        assert_eq!(spec.model_id, "my-model-v1-0");
        assert_eq!(registry.decode("my-model-v1-0").as_deref(), Some("my model/v1.0"));
        assert_eq!(registry.identifier_for("my model/v1.0").as_deref(), Some("my-model-v1-0"));

        // re-registering the same name is stable
        let again = registry.register(&cfg("my model/v1.0")).await.unwrap();
        assert_eq!(again.model_id, spec.model_id);
    }

    #[tokio::test]
    async fn test_collision_is_refused() {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let registry = IdentityRegistry::load(store).await.unwrap();

        registry.register(&cfg("My_Model")).await.unwrap();
        let err = registry.register(&cfg("my-model")).await.unwrap_err();
        match err {
            RegistryError::Collision(PlacementError::IdentityCollision { identifier, existing, .. }) => {
                assert_eq!(identifier, "my-model");
                assert_eq!(existing, "My_Model");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(registry.catalog().len(), 1);
        assert_eq!(registry.identifier_for("my-model"), None);
    }

    #[tokio::test]
    async fn test_issued_identifiers_survive_restart() {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        {
            let registry = IdentityRegistry::load(store.clone()).await.unwrap();
            registry.register(&cfg("DeepMET_v1")).await.unwrap();
        }

        let registry = IdentityRegistry::load(store).await.unwrap();
        // a name removed from config still decodes
        assert_eq!(registry.decode("deepmet-v1").as_deref(), Some("DeepMET_v1"));
        assert!(registry.catalog().is_empty());
        // and a different name with the same encoding is still refused
        assert!(registry.register(&cfg("deepmet-v1")).await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_footprint() {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let registry = IdentityRegistry::load(store).await.unwrap();
        registry.register(&cfg("resnet")).await.unwrap();

        let spec = registry.refresh_footprint("resnet", 42).unwrap();
        assert_eq!(spec.memory_footprint_bytes, 42);
        assert_eq!(registry.spec("resnet").unwrap().memory_footprint_bytes, 42);
        assert!(registry.refresh_footprint("missing", 1).is_none());
    }
}
