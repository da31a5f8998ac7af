use std::sync::Arc;

use anyhow::Result;

use sonic_common::Epoch;
use sonic_meta::{get_json, MetaStore};

pub const EPOCH_KEY: &str = "/sonic/epoch";

/// Persists the last issued epoch so epochs keep increasing across restarts.
pub struct EpochStore {
    store: Arc<dyn MetaStore>,
    revision: u64,
}

/// Outcome of a persist attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persisted {
    Stored,
    /// Someone else wrote a newer epoch; the caller must skip past it.
    Behind(Epoch),
}

impl EpochStore {
    /// Open the store and return the last persisted epoch (0 if none).
    pub async fn open(store: Arc<dyn MetaStore>) -> Result<(Self, Epoch)> {
        let (epoch, revision) = get_json::<Epoch>(store.as_ref(), EPOCH_KEY)
            .await?
            .unwrap_or((0, 0));
        Ok((Self { store, revision }, epoch))
    }

    pub async fn persist(&mut self, epoch: Epoch) -> Result<Persisted> {
        let value = serde_json::to_vec(&epoch)?;
        let (ok, current) = self
            .store
            .compare_and_swap(EPOCH_KEY, self.revision, value.clone())
            .await?;
        if ok {
            self.revision = current;
            return Ok(Persisted::Stored);
        }

        let (stored, revision) = get_json::<Epoch>(self.store.as_ref(), EPOCH_KEY)
            .await?
            .unwrap_or((0, 0));
        if stored >= epoch {
            self.revision = revision;
            return Ok(Persisted::Behind(stored));
        }

        // our revision was stale but the stored epoch is older: overwrite it
        let (ok, current) = self.store.compare_and_swap(EPOCH_KEY, revision, value).await?;
        if !ok {
            anyhow::bail!("epoch key changed concurrently at revision {current}");
        }
        self.revision = current;
        Ok(Persisted::Stored)
    }
}
