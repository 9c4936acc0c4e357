//! Main axum router and HTTP request handlers.
//!
//! Routes:
//! - `POST   /upload`                  - multipart `project_id` + `file` (zip)
//! - `DELETE /delete?project_id=<id>`  - remove the project's repository (`POST` also accepted)
//! - `GET    /health`                  - liveness, never authenticated
//! - `GET    /metrics`                 - Prometheus metrics

use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Query, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, instrument};

use crate::auth::require_api_key;
use crate::health::health_handler;
use crate::upload::{DeleteError, UploadError};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = DefaultBodyLimit::max(state.config.server.max_upload_bytes);

    Router::new()
        .route("/upload", post(handle_upload).layer(body_limit))
        .route("/delete", post(handle_delete).delete(handle_delete))
        .route("/metrics", get(handle_metrics))
        // Applies only to the routes above.
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_api_key,
        ))
        .route("/health", get(health_handler))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub git_url: String,
}

/// `POST /upload`
#[instrument(skip_all)]
async fn handle_upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut project_id: Option<String> = None;
    let mut archive: Option<Bytes> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("project_id") => project_id = Some(field.text().await?),
            Some("file") => archive = Some(field.bytes().await?),
            _ => {}
        }
    }

    let project_id = project_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("project_id required".into()))?;
    let archive = archive.ok_or_else(|| AppError::BadRequest("file required".into()))?;

    let git_url = state.uploader.process_upload(&project_id, archive).await?;
    Ok(Json(UploadResponse {
        success: true,
        git_url,
    }))
}

#[derive(Debug, Deserialize)]
struct DeleteParams {
    project_id: Option<String>,
}

/// `DELETE /delete?project_id=<id>`
#[instrument(skip_all)]
async fn handle_delete(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DeleteParams>,
) -> Result<Response, AppError> {
    let project_id = params
        .project_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("project_id required".into()))?;

    state.uploader.delete_project(&project_id).await?;
    Ok(Json(json!({ "success": "true" })).into_response())
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let body = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(format!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Missing or malformed request input.
    BadRequest(String),
    /// The caller did not present the configured API key.
    Unauthorized(String),
    /// The multipart body could not be read (includes oversize bodies).
    Multipart(MultipartError),
    /// Extraction, provisioning, publishing or any other server-side failure.
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Multipart(err) => (err.status(), err.body_text()),
            AppError::Internal(msg) => {
                error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::Multipart(err)
    }
}

impl From<DeleteError> for AppError {
    fn from(err: DeleteError) -> Self {
        match err {
            DeleteError::Validation(msg) => AppError::BadRequest(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Validation(msg) => AppError::BadRequest(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
