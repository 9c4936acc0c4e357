use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::http::handler::AppError;
use crate::AppState;

/// axum middleware enforcing the configured bearer secret.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = state.config.credentials.api_key.as_deref() {
        if !bearer_matches(request.headers(), expected) {
            debug!(path = %request.uri().path(), "rejected request without valid API key");
            return AppError::Unauthorized("Unauthorized".into()).into_response();
        }
    }
    next.run(request).await
}

/// True when the `Authorization` header is exactly `Bearer <expected>`.
fn bearer_matches(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token.as_bytes().ct_eq(expected.as_bytes()).into())
}
