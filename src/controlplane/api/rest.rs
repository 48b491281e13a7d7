//! REST API Handlers
//!
//! Read-mostly inspection endpoints over the manager's registry, plus a
//! trigger for an immediate reconcile pass.

use crate::controlplane::{LifecycleManager, ManagerStatus};
use crate::domain::{ClaimRecord, VolumeId, VolumePhase, VolumeRecord};
use crate::error::Error;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Filters for the volume listing
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeQuery {
    /// Phase name, case-insensitive (e.g. `available`)
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub storage_class: Option<String>,
}

/// Volume listing response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeListResponse {
    pub count: usize,
    pub volumes: Vec<VolumeRecord>,
}

/// Claim listing response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimListResponse {
    pub count: usize,
    pub claims: Vec<ClaimRecord>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiErrorResponse {
    fn respond(status: StatusCode, error: &str, message: String) -> Response {
        (
            status,
            Json(ApiErrorResponse {
                error: error.into(),
                message,
                details: None,
            }),
        )
            .into_response()
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    manager: Arc<LifecycleManager>,
}

impl RestRouter {
    pub fn new(manager: Arc<LifecycleManager>) -> Self {
        Self { manager }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            manager: self.manager,
        };

        Router::new()
            .route("/v1/volumes", get(list_volumes))
            .route("/v1/volumes/:id", get(get_volume))
            .route("/v1/claims", get(list_claims))
            .route("/v1/status", get(get_status))
            .route("/v1/reconcile", post(trigger_reconcile))
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    manager: Arc<LifecycleManager>,
}

// =============================================================================
// Handlers
// =============================================================================

fn parse_phase(raw: &str) -> Option<VolumePhase> {
    [
        VolumePhase::Pending,
        VolumePhase::Available,
        VolumePhase::Bound,
        VolumePhase::Released,
        VolumePhase::Failed,
    ]
    .into_iter()
    .find(|phase| phase.to_string().eq_ignore_ascii_case(raw))
}

/// List volume records, optionally filtered
async fn list_volumes(
    State(state): State<AppState>,
    Query(query): Query<VolumeQuery>,
) -> Response {
    let phase = match query.phase.as_deref().map(|raw| (raw, parse_phase(raw))) {
        Some((raw, None)) => {
            return ApiErrorResponse::respond(
                StatusCode::BAD_REQUEST,
                "invalid_phase",
                format!(
                    "Invalid phase: {}. Use pending, available, bound, released or failed",
                    raw
                ),
            );
        }
        Some((_, phase)) => phase,
        None => None,
    };

    let mut volumes: Vec<VolumeRecord> = state
        .manager
        .registry()
        .records()
        .into_iter()
        .filter(|r| phase.map_or(true, |p| r.phase == p))
        .filter(|r| {
            query
                .storage_class
                .as_deref()
                .map_or(true, |class| r.storage_class() == class)
        })
        .collect();
    volumes.sort_by(|a, b| a.path().cmp(b.path()));

    (
        StatusCode::OK,
        Json(VolumeListResponse {
            count: volumes.len(),
            volumes,
        }),
    )
        .into_response()
}

/// Get one volume record
async fn get_volume(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.registry().get(&VolumeId::from(id.as_str())) {
        Some(record) => (StatusCode::OK, Json(record)).into_response(),
        None => ApiErrorResponse::respond(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Volume {} not found", id),
        ),
    }
}

/// List claims known to the manager
async fn list_claims(State(state): State<AppState>) -> Response {
    let claims = state.manager.registry().claims();
    (
        StatusCode::OK,
        Json(ClaimListResponse {
            count: claims.len(),
            claims,
        }),
    )
        .into_response()
}

async fn get_status(State(state): State<AppState>) -> Json<ManagerStatus> {
    Json(state.manager.status())
}

/// Run a reconcile pass now
async fn trigger_reconcile(State(state): State<AppState>) -> Response {
    info!("Reconcile pass requested over REST");

    match state.manager.reconcile_once().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => {
            error!(error = %e, "Requested reconcile pass failed");
            let status = match e {
                Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                _ if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            ApiErrorResponse::respond(status, "reconcile_failed", e.to_string())
        }
    }
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.manager.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "manager not running")
    }
}
