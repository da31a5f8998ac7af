use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::placement::Epoch;

/// A routable endpoint in a model's address pool, as published to load balancers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolEndpoint {
    pub model_id: String,
    pub server_id: String,
    pub address: String,
    pub http_port: u16,
    pub grpc_port: u16,
    pub epoch: Epoch,
    pub seq: u64,
    pub updated_at_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PoolEventKind {
    Add,
    Remove,
}

/// A committed label transition to be mirrored into an address pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolEvent {
    pub kind: PoolEventKind,
    pub model_id: String,
    pub server_id: String,
    pub address: String,
    pub epoch: Epoch,
    /// Ledger commit sequence; orders events that share an epoch.
    pub seq: u64,
}

impl PoolEvent {
    pub fn ordering_key(&self) -> (Epoch, u64) {
        (self.epoch, self.seq)
    }

    pub fn pair(&self) -> (String, String) {
        (self.model_id.clone(), self.server_id.clone())
    }
}

/// Per-model set of routable endpoints, derived from committed label state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressPool {
    pub model_id: String,
    /// server_id -> endpoint
    pub endpoints: BTreeMap<String, PoolEndpoint>,
}

impl AddressPool {
    pub fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            endpoints: BTreeMap::new(),
        }
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.endpoints.contains_key(server_id)
    }
}
