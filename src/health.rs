use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde_json::json;

/// Liveness endpoint probed by peer scanners: always `{status:"ok"}`.
pub async fn health() -> impl IntoResponse {
	(StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
}

/// Prometheus metrics endpoint: returns metrics in Prometheus text format
pub async fn metrics_handler(State(state): State<crate::state::AppState>) -> impl IntoResponse {
	let metrics_text = state.metrics.encode();
	(StatusCode::OK, metrics_text).into_response()
}
