//! Messaging routes: text sends, media sends, read receipts

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use super::{error_response, json_response, read_json};
use crate::pipeline::MediaRequest;
use crate::server::AppState;
use crate::transport::MediaKind;

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    #[serde(default)]
    user: String,
    #[serde(default)]
    phone_number: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct SendMediaRequest {
    #[serde(default)]
    user: String,
    #[serde(default)]
    phone_number: String,
    #[serde(default)]
    media: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MarkReadRequest {
    #[serde(default)]
    user: String,
    #[serde(default)]
    message_ids: Vec<String>,
    #[serde(default)]
    from_jid: String,
    #[serde(default)]
    to_jid: String,
}

/// POST /send - text message
pub async fn send_message(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body: SendMessageRequest = match read_json(req).await {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };

    match state
        .pipeline
        .send_text(&body.user, &body.phone_number, &body.message)
        .await
    {
        Ok(ack) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "msg": "Message sent successfully",
                "message_id": ack.message_id,
                "timestamp": ack.timestamp.to_rfc3339(),
            }),
        ),
        Err(e) => {
            warn!("Message send error: {}", e);
            error_response(&e)
        }
    }
}

/// POST /send/{image,video,file} - media message
pub async fn send_media(
    state: Arc<AppState>,
    req: Request<Incoming>,
    kind: MediaKind,
) -> Response<Full<Bytes>> {
    let body: SendMediaRequest = match read_json(req).await {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };

    let request = MediaRequest {
        user: body.user,
        recipient: body.phone_number,
        kind,
        data: body.media,
        url: body.url,
        caption: body.caption,
        file_name: body.file_name,
    };

    match state.pipeline.send_media(request).await {
        Ok(outcome) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "msg": format!("{} sent successfully", kind),
                "message_id": outcome.ack.message_id,
                "file_name": outcome.file_name,
                "timestamp": outcome.ack.timestamp.to_rfc3339(),
            }),
        ),
        Err(e) => {
            warn!("Media send error: {}", e);
            error_response(&e)
        }
    }
}

/// POST /msg/read - read receipts
pub async fn mark_read(state: Arc<AppState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body: MarkReadRequest = match read_json(req).await {
        Ok(body) => body,
        Err(e) => return error_response(&e),
    };

    match state
        .pipeline
        .mark_read(&body.user, &body.message_ids, &body.from_jid, &body.to_jid)
        .await
    {
        Ok(()) => json_response(
            StatusCode::OK,
            serde_json::json!({ "msg": "Messages marked as read" }),
        ),
        Err(e) => {
            warn!("Mark read error: {}", e);
            error_response(&e)
        }
    }
}
