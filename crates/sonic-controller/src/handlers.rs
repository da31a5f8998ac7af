use std::collections::{BTreeMap, BTreeSet};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use sonic_common::{
    now_ms, CommittedPlacement, Condition, ConditionKind, Epoch, HealthStatus, ModelSpec,
    ReconciliationTask,
};

use crate::pool_sync::PoolView;
use crate::state::AppState;

const MB: u64 = 1024 * 1024;

pub fn router(st: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status))
        .route("/conditions", get(conditions))
        .route("/conditions/:server_id/:model_id", delete(clear_condition))
        .route("/identities", get(identities))
        .route("/models/:model_id/footprint", put(update_footprint))
        .route("/pools", get(pools))
        .with_state(st)
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, st.metrics.render())
}

#[derive(Debug, Serialize)]
pub struct ServerStatus {
    pub server_id: String,
    pub address: String,
    pub health: HealthStatus,
    pub gpu_memory_total_bytes: u64,
    pub gpu_memory_used_bytes: u64,
    pub gpu_utilization: f64,
    pub last_observed_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct DecisionStatus {
    pub epoch: Epoch,
    pub created_at_ms: u64,
    pub targets: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub instance_id: String,
    pub started_at: String,
    pub snapshot_version: u64,
    pub servers: Vec<ServerStatus>,
    pub decision: DecisionStatus,
    pub committed: CommittedPlacement,
    pub conditions: Vec<Condition>,
    pub recent_tasks: Vec<ReconciliationTask>,
}

pub async fn status(State(st): State<AppState>) -> Json<StatusReport> {
    let observation = st.observations.borrow().clone();
    let decision = st.decisions.borrow().clone();
    let now = now_ms();
    let stale = st.observer_policy.stale_threshold_ms;

    let servers = observation
        .snapshot
        .servers
        .values()
        .map(|s| ServerStatus {
            server_id: s.server_id.clone(),
            address: s.address.clone(),
            health: s.effective_health(now, stale),
            gpu_memory_total_bytes: s.gpu_memory_total_bytes,
            gpu_memory_used_bytes: s.gpu_memory_used_bytes,
            gpu_utilization: s.gpu_utilization,
            last_observed_ms: s.last_observed_ms,
        })
        .collect();

    Json(StatusReport {
        instance_id: st.instance_id.clone(),
        started_at: st.started_at.to_rfc3339(),
        snapshot_version: observation.snapshot.version,
        servers,
        decision: DecisionStatus {
            epoch: decision.epoch,
            created_at_ms: decision.created_at_ms,
            targets: decision.targets.clone(),
        },
        committed: st.ledger.snapshot().as_ref().clone(),
        conditions: st.conditions.list(),
        recent_tasks: st.tasks.recent(),
    })
}

pub async fn conditions(State(st): State<AppState>) -> Json<Vec<Condition>> {
    Json(st.conditions.list())
}

/// Clear a failed (server, model) pair so the planner may target it again.
pub async fn clear_condition(
    State(st): State<AppState>,
    Path((server_id, model_id)): Path<(String, String)>,
) -> StatusCode {
    if st
        .conditions
        .resolve(ConditionKind::ReconciliationFailed, Some(&server_id), Some(&model_id))
    {
        info!(%server_id, %model_id, "reconciliation failure cleared by operator");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

pub async fn identities(State(st): State<AppState>) -> Json<BTreeMap<String, String>> {
    Json(st.registry.identities())
}

#[derive(Debug, Deserialize)]
pub struct FootprintUpdate {
    pub memory_footprint_mb: u64,
}

pub async fn update_footprint(
    State(st): State<AppState>,
    Path(model_id): Path<String>,
    Json(body): Json<FootprintUpdate>,
) -> Result<Json<ModelSpec>, StatusCode> {
    let bytes = body.memory_footprint_mb.saturating_mul(MB);
    match st.registry.refresh_footprint(&model_id, bytes) {
        Some(spec) => {
            info!(%model_id, bytes, "footprint estimate refreshed");
            Ok(Json(spec))
        }
        None => Err(StatusCode::NOT_FOUND),
    }
}

pub async fn pools(State(st): State<AppState>) -> Json<PoolView> {
    let view = st.pools.borrow().clone();
    Json(view.as_ref().clone())
}
