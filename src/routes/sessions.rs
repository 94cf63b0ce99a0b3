//! Session lifecycle routes: create, QR linking, status, restart, logout

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use super::{error_response, json_response, query_param, read_json};
use crate::server::AppState;
use crate::session::SessionStatus;
use crate::types::PosternError;

#[derive(Debug, Deserialize)]
struct UserRequest {
    #[serde(default)]
    user: String,
}

fn status_json(user: &str, status: &SessionStatus) -> serde_json::Value {
    serde_json::json!({
        "user": user,
        "state": status.state,
        "logged_in": status.logged_in,
        "connected": status.connected,
        "needs_qr": status.needs_qr,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

/// POST /wa/add - create a session in `Fresh`
pub async fn add_session(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body: UserRequest = match read_json(req).await {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };

    match state.supervisor.add_session(&body.user).await {
        Ok(_) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "msg": "Session created. Please request QR code using /wa/qr"
            }),
        ),
        Err(e) => error_response(&e),
    }
}

/// GET /wa/qr?user= - run the QR linking protocol, returning the textual
/// payload for the caller to render
pub async fn qr(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let Some(user) = query_param(&req, "user") else {
        return error_response(&PosternError::MissingUser);
    };

    let session = match state.supervisor.find_or_restore(&user).await {
        Ok(session) => session,
        Err(e) => return error_response(&e),
    };

    match session.request_qr().await {
        Ok(code) => json_response(
            StatusCode::OK,
            serde_json::json!({ "user": user, "qr": code }),
        ),
        Err(e) => error_response(&e),
    }
}

/// GET/POST /wa/status - session status snapshot
pub async fn status(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let user = if req.method() == Method::POST {
        match read_json::<UserRequest>(req).await {
            Ok(body) => body.user,
            Err(e) => return error_response(&e),
        }
    } else {
        query_param(&req, "user").unwrap_or_default()
    };

    let session = match state.supervisor.find_existing(&user).await {
        Ok(Some(session)) => session,
        Ok(None) => return error_response(&PosternError::SessionNotFound(user)),
        Err(e) => return error_response(&e),
    };

    let status = session.status().await;
    info!(
        "Status check for user {}: logged_in={}, connected={}",
        user, status.logged_in, status.connected
    );
    json_response(StatusCode::OK, status_json(&user, &status))
}

/// POST /wa/restart - tear the session down and restore it from disk
pub async fn restart(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body: UserRequest = match read_json(req).await {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };

    info!("Restarting session for user: {}", body.user);
    match state.supervisor.restart(&body.user).await {
        Ok(session) => {
            let status = session.status().await;
            let msg = if status.needs_qr {
                format!(
                    "Session restored but needs QR code. Please request QR code using /wa/qr?user={}",
                    body.user
                )
            } else {
                "Session restored and connected successfully".to_string()
            };
            json_response(
                StatusCode::OK,
                serde_json::json!({ "msg": msg, "status": status_json(&body.user, &status) }),
            )
        }
        Err(e) => error_response(&e),
    }
}

/// POST /wa/logout - acknowledge and finalize asynchronously
pub async fn logout(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body: UserRequest = match read_json(req).await {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };

    match state.supervisor.logout(&body.user).await {
        Ok(()) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "msg": "Logout process started",
                "user": body.user,
            }),
        ),
        Err(e) => error_response(&e),
    }
}
