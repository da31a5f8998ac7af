use std::sync::Arc;

use tokio::sync::watch;

use sonic_common::{CommittedEntry, CommittedPlacement, Epoch, LabelState};

/// In-memory mirror of the committed label state.
///
/// Only the reconciler writes, and only after the matching label write has
/// succeeded. Every commit gets the next ledger-wide sequence number, which
/// orders pool events that share an epoch.
#[derive(Debug)]
pub struct CommittedLedger {
    tx: watch::Sender<Arc<CommittedPlacement>>,
}

impl CommittedLedger {
    pub fn new(initial: CommittedPlacement) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<CommittedPlacement>> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> Arc<CommittedPlacement> {
        self.tx.borrow().clone()
    }

    /// Record `state` for the pair, or drop the pair when `state` is `None`.
    /// Returns the entry's ordering key.
    pub fn commit(
        &self,
        server_id: &str,
        model_id: &str,
        state: Option<LabelState>,
        epoch: Epoch,
    ) -> (Epoch, u64) {
        let mut key = (epoch, 0);
        self.tx.send_modify(|current| {
            let placement = Arc::make_mut(current);
            placement.version += 1;
            let seq = placement.version;
            key = (epoch, seq);
            match state {
                Some(state) => {
                    placement
                        .servers
                        .entry(server_id.to_string())
                        .or_default()
                        .insert(model_id.to_string(), CommittedEntry { state, epoch, seq });
                }
                None => {
                    if let Some(models) = placement.servers.get_mut(server_id) {
                        models.remove(model_id);
                        if models.is_empty() {
                            placement.servers.remove(server_id);
                        }
                    }
                }
            }
        });
        key
    }

    /// Forget a server that left the deployment.
    pub fn drop_server(&self, server_id: &str) {
        self.tx.send_if_modified(|current| {
            if !current.servers.contains_key(server_id) {
                return false;
            }
            let placement = Arc::make_mut(current);
            placement.version += 1;
            placement.servers.remove(server_id);
            true
        });
    }
}
