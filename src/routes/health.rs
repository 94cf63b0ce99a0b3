//! Health endpoints
//!
//! The root endpoint is a cheap liveness probe for container health checks;
//! `/health` adds per-session detail.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use std::sync::Arc;

use super::json_response;
use crate::server::AppState;

/// Liveness probe with uptime and session count
pub fn root(state: Arc<AppState>) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "ok",
            "uptime": format!("{:?}", state.started_at.elapsed()),
            "session_count": state.supervisor.session_count(),
            "version": env!("CARGO_PKG_VERSION"),
        }),
    )
}

/// Detailed health: total and logged-in session counts
pub async fn health(state: Arc<AppState>) -> Response<Full<Bytes>> {
    let total = state.supervisor.session_count();
    let active = state.supervisor.active_count().await;

    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "ok",
            "uptime": format!("{:?}", state.started_at.elapsed()),
            "total_sessions": total,
            "active_sessions": active,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }),
    )
}
