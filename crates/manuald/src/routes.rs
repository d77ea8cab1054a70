//! API routes for manuald

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use manual_shared::api::{
    AskRequest, FeedbackRequest, FeedbackResponse, HealthResponse, HistoryResponse,
    SessionResponse,
};
use manual_shared::{QaError, RestrictionStatus, USER_HEADER, VERSION};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info};

use crate::server::AppState;

type AppStateArc = Arc<AppState>;

pub const NDJSON: &str = "application/x-ndjson";

/// `QaError` rendered as a JSON error response.
pub struct ApiError(pub QaError);

impl From<QaError> for ApiError {
    fn from(err: QaError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if self.0.is_internal() {
            error!("  Request failed: {:?}", self.0);
        }
        (status, Json(self.0.to_body())).into_response()
    }
}

fn user_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ApiError(QaError::Unauthenticated))
}

// ============================================================================
// Question Routes
// ============================================================================

pub fn question_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/products/:product/questions", post(ask_question))
        .route("/v1/products/:product/feedback", post(record_feedback))
}

/// Admit the question, then stream its progress as NDJSON
async fn ask_question(
    State(state): State<AppStateArc>,
    Path(product): Path<String>,
    headers: HeaderMap,
    Json(req): Json<AskRequest>,
) -> Result<Response, ApiError> {
    let user = user_id(&headers)?;
    let rx = state.service.ask(&user, &product, req).await?;

    let lines = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(event.to_line()));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, NDJSON)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(lines))
        .map_err(|e| ApiError(QaError::Internal(e.to_string())))
}

async fn record_feedback(
    State(state): State<AppStateArc>,
    Path(product): Path<String>,
    headers: HeaderMap,
    Json(req): Json<FeedbackRequest>,
) -> Result<Json<FeedbackResponse>, ApiError> {
    let user = user_id(&headers)?;
    let response = state.service.record_feedback(&user, &product, req).await?;
    Ok(Json(response))
}

// ============================================================================
// Session Routes
// ============================================================================

pub fn session_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/products/:product/sessions", post(reset_session))
        .route("/v1/sessions/:id/messages", get(session_messages))
}

async fn reset_session(
    State(state): State<AppStateArc>,
    Path(product): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SessionResponse>, ApiError> {
    let user = user_id(&headers)?;
    let session = state.service.reset_session(&user, &product).await?;
    info!("  Session reset for {} on {}", user, product);
    Ok(Json(SessionResponse { session }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn session_messages(
    State(state): State<AppStateArc>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Result<Json<HistoryResponse>, ApiError> {
    let user = user_id(&headers)?;
    Ok(Json(state.service.history(&user, &id, query.limit).await?))
}

// ============================================================================
// Status Routes
// ============================================================================

pub fn status_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/v1/restriction", get(restriction))
        .route("/v1/health", get(health))
}

async fn restriction(
    State(state): State<AppStateArc>,
    headers: HeaderMap,
) -> Result<Json<RestrictionStatus>, ApiError> {
    let user = user_id(&headers)?;
    Ok(Json(state.service.restriction(&user).await?))
}

async fn health(State(state): State<AppStateArc>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: VERSION.to_string(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds().max(0) as u64,
        started_at: state.started_at,
    })
}
