//! REST API handlers

use axum::{
    extract::{MatchedPath, Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::bans::BanOutcome;
use crate::error::Error;
use crate::metrics;
use crate::models::{NewNode, Node, NodeId, UserId};
use crate::notifications::Alert;
use crate::orchestrator::{
    BanRequest, FleetStats, ProvisionOutcome, ProvisionRequest, RetireOutcome,
};

use super::AppState;

// ============================================================================
// API Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Simple error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,

    /// Machine-readable error category
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
            kind: None,
        }
    }
}

/// Orchestrator error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

/// HTTP status for an orchestrator error
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::NotFound { .. } | Error::TariffNotFound(_) => StatusCode::NOT_FOUND,
        Error::Banned { .. } | Error::PermissionDenied { .. } => StatusCode::FORBIDDEN,
        Error::FreeLimitReached { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::NoCapacity => StatusCode::SERVICE_UNAVAILABLE,
        Error::NodeUnreachable { .. } | Error::NodeRejected { .. } => StatusCode::BAD_GATEWAY,
        Error::Database(_) | Error::Json(_) | Error::Config(_) | Error::Other { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        let body = ErrorResponse {
            success: false,
            error: self.0.user_message(),
            kind: Some(self.0.category().as_str()),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct UnbanRequest {
    pub actor_id: UserId,
    pub target_id: UserId,
}

#[derive(Debug, Serialize)]
pub struct UnbanResponse {
    pub target_id: UserId,
    pub cleared: usize,
}

#[derive(Debug, Deserialize)]
pub struct AddNodeRequest {
    pub actor_id: UserId,
    #[serde(flatten)]
    pub node: NewNode,
}

#[derive(Debug, Deserialize)]
pub struct ActorRequest {
    pub actor_id: UserId,
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/provision", post(provision))
        .route("/api/bans", post(ban))
        .route("/api/unban", post(unban))
        .route("/api/stats", get(get_stats))
        .route("/api/nodes", get(list_nodes).post(add_node))
        .route("/api/nodes/{id}/retire", post(retire_node))
        .route("/api/alerts", get(list_alerts))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(middleware::from_fn(track_requests))
        .with_state(state)
}

async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(expected) = state.api_key.as_deref() {
        let provided = request
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok());

        if provided != Some(expected) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new("Invalid or missing API key")),
            )
                .into_response();
        }
    }

    next.run(request).await
}

async fn track_requests(request: Request, next: Next) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let response = next.run(request).await;
    metrics::record_api_request(&endpoint, response.status().as_u16());
    response
}

// ============================================================================
// Handlers
// ============================================================================

async fn provision(
    State(state): State<AppState>,
    Json(request): Json<ProvisionRequest>,
) -> ApiResult<ProvisionOutcome> {
    let outcome = state.orchestrator.provision(request).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

async fn ban(State(state): State<AppState>, Json(request): Json<BanRequest>) -> ApiResult<BanOutcome> {
    let outcome = state.orchestrator.ban(request).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

async fn unban(
    State(state): State<AppState>,
    Json(request): Json<UnbanRequest>,
) -> ApiResult<UnbanResponse> {
    let cleared = state
        .orchestrator
        .unban(request.actor_id, request.target_id)?;
    Ok(Json(ApiResponse::success(UnbanResponse {
        target_id: request.target_id,
        cleared,
    })))
}

async fn get_stats(State(state): State<AppState>) -> ApiResult<FleetStats> {
    let stats = state.orchestrator.stats().await?;
    Ok(Json(ApiResponse::success(stats)))
}

async fn list_nodes(State(state): State<AppState>) -> Json<ApiResponse<Vec<Node>>> {
    Json(ApiResponse::success(state.orchestrator.list_nodes().await))
}

async fn add_node(
    State(state): State<AppState>,
    Json(request): Json<AddNodeRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Node>>), ApiError> {
    let node = state
        .orchestrator
        .add_node(request.actor_id, request.node)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(node))))
}

async fn retire_node(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<RetireOutcome> {
    let outcome = state
        .orchestrator
        .retire_node(request.actor_id, NodeId(id))
        .await?;
    Ok(Json(ApiResponse::success(outcome)))
}

async fn list_alerts(State(state): State<AppState>) -> Json<ApiResponse<Vec<Alert>>> {
    Json(ApiResponse::success(state.alerts.active_alerts()))
}

// ============================================================================
// Tests
// ============================================================================
