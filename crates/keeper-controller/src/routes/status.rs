//! Status routes: `/v1/status/*`
//!
//! Read-only views of the latest instance and policy snapshots.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use keeper_core::instance::InstanceStatus;
use keeper_core::policy_controller::PolicyStatus;
use serde::Serialize;

use crate::error::AppError;
use crate::state::AppState;

/// Build the `/v1/status` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/instances", get(list_instances))
        .route("/instances/{name}", get(get_instance))
        .route("/policies", get(list_policies))
        .route("/policies/{name}", get(get_policy))
}

// ── Request / Response types ─────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct InstanceListResponse {
    pub instances: Vec<InstanceStatus>,
}

#[derive(Debug, Serialize)]
pub struct PolicyListResponse {
    pub policies: Vec<PolicyStatus>,
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn list_instances(State(state): State<Arc<AppState>>) -> Json<InstanceListResponse> {
    Json(InstanceListResponse {
        instances: state.instances.borrow().clone(),
    })
}

async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<InstanceStatus>, AppError> {
    state
        .instances
        .borrow()
        .iter()
        .find(|i| i.name == name)
        .cloned()
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no instance named '{name}'")))
}

async fn list_policies(State(state): State<Arc<AppState>>) -> Json<PolicyListResponse> {
    Json(PolicyListResponse {
        policies: state.policies.borrow().clone(),
    })
}

async fn get_policy(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<PolicyStatus>, AppError> {
    state
        .policies
        .borrow()
        .iter()
        .find(|p| p.name == name)
        .cloned()
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no policy named '{name}'")))
}
