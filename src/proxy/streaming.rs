use axum::{body::Body, http::StatusCode, response::Response};
use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::ErrorCode;

/// One SSE frame: `data: <json>\n\n`.
pub fn sse_data_frame(payload: &Value) -> Bytes {
    Bytes::from(format!(
        "data: {}\n\n",
        serde_json::to_string(payload).unwrap_or_default()
    ))
}

/// Chat-dialect stream terminator.
pub fn sse_done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// Terminal in-stream error event. Written at most once, only after
/// ordinary events can no longer be retried on another account.
pub fn sse_error_frame(message: &str, code: ErrorCode) -> Bytes {
    sse_data_frame(&json!({
        "error": {
            "message": message,
            "type": "api_error",
            "code": code.as_str(),
        }
    }))
}

/// Commit event-stream headers. The `X-Accel-Buffering` hint keeps
/// fronting proxies from batching frames.
pub fn build_sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(body)
        .unwrap()
}

pub fn build_json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_string(payload).unwrap_or_default()))
        .unwrap()
}
