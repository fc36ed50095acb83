//! System routes: `/v1/sys/*`

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use keeper_core::policy_controller::PolicyOutcome;
use serde::Serialize;

use crate::state::AppState;

/// Build the `/v1/sys` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok` when every known instance is unsealed and no policy failed.
    pub status: &'static str,
    pub instances: usize,
    pub unsealed: usize,
    pub policies: usize,
    pub policies_failed: usize,
    pub root_token: bool,
}

// ── Handlers ─────────────────────────────────────────────────────────

/// Always answers 200 so probes track the keeper, not the cluster.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (instances, unsealed) = {
        let snapshot = state.instances.borrow();
        let unsealed = snapshot.iter().filter(|i| i.state.is_unsealed()).count();
        (snapshot.len(), unsealed)
    };
    let (policies, policies_failed) = {
        let snapshot = state.policies.borrow();
        let failed = snapshot
            .iter()
            .filter(|p| matches!(p.outcome, PolicyOutcome::Failed { .. }))
            .count();
        (snapshot.len(), failed)
    };

    let status = if unsealed == instances && policies_failed == 0 {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        instances,
        unsealed,
        policies,
        policies_failed,
        root_token: state.root_token.is_available(),
    })
}
