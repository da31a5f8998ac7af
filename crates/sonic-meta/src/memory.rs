use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use tokio::sync::RwLock;

use crate::types::{CreateOutcome, MetaStore};

/// Single-process store, used for tests and `--store memory` runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetaStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, (Vec<u8>, u64)>,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.revision = self.revision.saturating_add(1);
        self.revision
    }

    fn current_rev(&self, key: &str) -> u64 {
        self.kv.get(key).map(|(_, rev)| *rev).unwrap_or(0)
    }
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MetaStore for MemoryMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let rev = inner.bump();
        inner.kv.insert(key.to_string(), (value, rev));
        Ok(rev)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        Ok(inner.kv.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        if inner.kv.remove(key).is_none() {
            return Ok(inner.revision);
        }
        Ok(inner.bump())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, rev))| (k.clone(), v.clone(), *rev))
            .collect())
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<CreateOutcome> {
        let mut inner = self.inner.write().await;
        if let Some((existing, rev)) = inner.kv.get(key) {
            return Ok(CreateOutcome::Exists {
                value: existing.clone(),
                revision: *rev,
            });
        }
        let rev = inner.bump();
        inner.kv.insert(key.to_string(), (value, rev));
        Ok(CreateOutcome::Created(rev))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)> {
        let mut inner = self.inner.write().await;
        let current = inner.current_rev(key);
        if current != expected_revision {
            return Ok((false, current));
        }
        let rev = inner.bump();
        inner.kv.insert(key.to_string(), (value, rev));
        Ok((true, rev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_refuses_overwrite() {
        let store = MemoryMetaStore::new();
        let first = store.create("/k", b"a".to_vec()).await.unwrap();
        assert!(matches!(first, CreateOutcome::Created(_)));

        let second = store.create("/k", b"b".to_vec()).await.unwrap();
        match second {
            CreateOutcome::Exists { value, .. } => assert_eq!(value, b"a".to_vec()),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(store.get("/k").await.unwrap().unwrap().0, b"a".to_vec());
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryMetaStore::new();
        let (ok, rev) = store.compare_and_swap("/epoch", 0, b"1".to_vec()).await.unwrap();
        assert!(ok);

        let (ok, current) = store.compare_and_swap("/epoch", 0, b"2".to_vec()).await.unwrap();
        assert!(!ok);
        assert_eq!(current, rev);

        let (ok, _) = store.compare_and_swap("/epoch", rev, b"2".to_vec()).await.unwrap();
        assert!(ok);
        assert_eq!(store.get("/epoch").await.unwrap().unwrap().0, b"2".to_vec());
    }

    #[tokio::test]
    async fn test_list_prefix_is_bounded() {
        let store = MemoryMetaStore::new();
        store.put("/pools/a/s0", vec![1]).await.unwrap();
        store.put("/pools/a/s1", vec![2]).await.unwrap();
        store.put("/pools/b/s0", vec![3]).await.unwrap();
        store.put("/poolsx", vec![4]).await.unwrap();

        let keys: Vec<String> = store
            .list_prefix("/pools/a/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _, _)| k)
            .collect();
        assert_eq!(keys, vec!["/pools/a/s0", "/pools/a/s1"]);
    }

    #[tokio::test]
    async fn test_delete_missing_key_keeps_revision() {
        let store = MemoryMetaStore::new();
        let rev = store.put("/k", vec![]).await.unwrap();
        assert_eq!(store.delete("/missing").await.unwrap(), rev);
        assert!(store.delete("/k").await.unwrap() > rev);
        assert!(store.get("/k").await.unwrap().is_none());
        assert!(store.list_prefix("/").await.unwrap().is_empty());
    }
}
