use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use sonic_common::PlacementDecision;

use crate::conditions::ConditionBoard;
use crate::ledger::CommittedLedger;
use crate::metrics::SharedMetrics;
use crate::observer::{Observation, ObserverPolicy};
use crate::pool_sync::PoolView;
use crate::reconcile::TaskHistory;
use crate::registry::IdentityRegistry;

#[derive(Clone)]
pub struct AppState {
    pub instance_id: String,
    pub started_at: DateTime<Utc>,
    pub registry: Arc<IdentityRegistry>,
    pub conditions: Arc<ConditionBoard>,
    pub metrics: Arc<SharedMetrics>,
    pub ledger: Arc<CommittedLedger>,
    pub tasks: TaskHistory,
    pub observations: watch::Receiver<Arc<Observation>>,
    pub decisions: watch::Receiver<Arc<PlacementDecision>>,
    pub pools: watch::Receiver<Arc<PoolView>>,
    pub observer_policy: ObserverPolicy,
}
