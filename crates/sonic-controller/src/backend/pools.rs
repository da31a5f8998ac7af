use std::sync::Arc;

use async_trait::async_trait;

use sonic_common::{ControlError, PoolEndpoint};
use sonic_meta::{put_json, MetaStore};

use super::PoolApi;

const POOL_PREFIX: &str = "/sonic/pools/";

/// Address pools published to the metadata store as
/// `/sonic/pools/{model_id}/{server_id}` with a JSON [`PoolEndpoint`] value.
#[derive(Clone)]
pub struct StorePoolApi {
    store: Arc<dyn MetaStore>,
}

impl StorePoolApi {
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        Self { store }
    }

    fn key(model_id: &str, server_id: &str) -> String {
        format!("{POOL_PREFIX}{model_id}/{server_id}")
    }
}

fn store_error(e: anyhow::Error) -> ControlError {
    ControlError::Backend(e.to_string())
}

#[async_trait]
impl PoolApi for StorePoolApi {
    async fn add_endpoint(&self, endpoint: &PoolEndpoint) -> Result<(), ControlError> {
        let key = Self::key(&endpoint.model_id, &endpoint.server_id);
        put_json(self.store.as_ref(), &key, endpoint)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn remove_endpoint(&self, model_id: &str, server_id: &str) -> Result<(), ControlError> {
        self.store
            .delete(&Self::key(model_id, server_id))
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn list_endpoints(&self) -> Result<Vec<PoolEndpoint>, ControlError> {
        let items = self.store.list_prefix(POOL_PREFIX).await.map_err(store_error)?;
        let mut out = Vec::with_capacity(items.len());
        for (key, value, _rev) in items {
            match serde_json::from_slice::<PoolEndpoint>(&value) {
                Ok(ep) => out.push(ep),
                Err(e) => tracing::warn!(%key, error = %e, "skipping malformed pool entry"),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonic_meta::MemoryMetaStore;

    fn endpoint(model_id: &str, server_id: &str) -> PoolEndpoint {
        PoolEndpoint {
            model_id: model_id.into(),
            server_id: server_id.into(),
            address: "10.0.0.1".into(),
            http_port: 8000,
            grpc_port: 8001,
            epoch: 1,
            seq: 1,
            updated_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_add_remove_is_idempotent() {
        let store = Arc::new(MemoryMetaStore::new());
        let pools = StorePoolApi::new(store.clone());

        pools.add_endpoint(&endpoint("deepmet", "triton-0")).await.unwrap();
        pools.add_endpoint(&endpoint("deepmet", "triton-0")).await.unwrap();
        pools.add_endpoint(&endpoint("deepmet", "triton-1")).await.unwrap();
        assert_eq!(pools.list_endpoints().await.unwrap().len(), 2);
        assert!(store.get("/sonic/pools/deepmet/triton-0").await.unwrap().is_some());

        pools.remove_endpoint("deepmet", "triton-0").await.unwrap();
        pools.remove_endpoint("deepmet", "triton-0").await.unwrap();
        let left = pools.list_endpoints().await.unwrap();
        assert_eq!(left, vec![endpoint("deepmet", "triton-1")]);
    }
}
