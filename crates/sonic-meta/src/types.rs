use anyhow::Result;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

/// Result of a create-if-absent write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(u64),
    Exists { value: Vec<u8>, revision: u64 },
}

/// Revisioned key/value store holding controller metadata.
///
/// Revisions are store-wide and monotonic; `0` stands for "absent".
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64>;
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>>;
    async fn delete(&self, key: &str) -> Result<u64>;
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>>;

    /// Write `value` only if `key` does not exist yet.
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<CreateOutcome>;

    /// Write `value` only if the key's mod revision equals `expected_revision`.
    /// Returns whether the write happened and the revision now current.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)>;
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn MetaStore,
    key: &str,
) -> Result<Option<(T, u64)>> {
    match store.get(key).await? {
        Some((bytes, rev)) => Ok(Some((serde_json::from_slice(&bytes)?, rev))),
        None => Ok(None),
    }
}

pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn MetaStore,
    key: &str,
    value: &T,
) -> Result<u64> {
    store.put(key, serde_json::to_vec(value)?).await
}
