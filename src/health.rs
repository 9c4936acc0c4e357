use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
}

/// `GET /health` handler.  Liveness only; never authenticated.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: HealthStatus::Ok,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_lowercase_status() {
        let body = serde_json::to_string(&HealthResponse {
            status: HealthStatus::Ok,
        })
        .unwrap();
        assert_eq!(body, r#"{"status":"ok"}"#);
    }
}
