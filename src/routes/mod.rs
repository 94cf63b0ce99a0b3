//! HTTP route handlers
//!
//! Thin JSON handlers over the supervisor and the send pipeline. Request
//! decoding and response shaping live here; every correctness decision
//! belongs to the core underneath.

pub mod contacts;
pub mod health;
pub mod messages;
pub mod sessions;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::types::{PosternError, Result};

/// Largest request body accepted (base64 media payloads included)
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Build a JSON response with permissive CORS headers
pub fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

/// Shape an error into its HTTP response
pub fn error_response(err: &PosternError) -> Response<Full<Bytes>> {
    let mut body = serde_json::json!({ "error": err.to_string() });
    if let Some(retry_after) = err.retry_after_secs() {
        body["retry_after"] = serde_json::json!(retry_after);
    }
    json_response(err.status_code(), body)
}

pub fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::NOT_FOUND,
        serde_json::json!({ "error": "Not Found", "path": path }),
    )
}

/// CORS preflight
pub fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// Decode a JSON request body
pub async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| PosternError::InvalidRequest(format!("failed to read body: {}", e)))?
        .to_bytes();

    if body.len() > MAX_BODY_BYTES {
        return Err(PosternError::InvalidRequest("request body too large".into()));
    }
    serde_json::from_slice(&body)
        .map_err(|_| PosternError::InvalidRequest("Invalid request".into()))
}

/// Extract a query parameter from a request URI
pub fn query_param(req: &Request<Incoming>, name: &str) -> Option<String> {
    req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            if key == name && !value.is_empty() {
                Some(value.to_string())
            } else {
                None
            }
        })
    })
}
