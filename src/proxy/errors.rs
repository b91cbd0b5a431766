use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::ErrorCode;

/// 429 issued when the per-model slot budget is full. Never retried.
pub fn concurrency_limit_response() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": {
                "message": "Model concurrency limit reached, please retry later",
                "code": ErrorCode::ModelConcurrencyLimit.as_str(),
            }
        })),
    )
        .into_response()
}

/// 429 issued after every eligible account hit its capacity limit.
pub fn capacity_exhausted_response(message: &str) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": {
                "message": message,
                "code": ErrorCode::RateLimitExceeded.as_str(),
            }
        })),
    )
        .into_response()
}

pub fn internal_error_response(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": {
                "message": message,
                "code": ErrorCode::InternalError.as_str(),
            }
        })),
    )
        .into_response()
}

pub fn unauthorized_response() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "message": "Invalid API key",
                "code": "invalid_api_key",
            }
        })),
    )
        .into_response()
}

pub fn bad_request_response(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": {
                "message": message,
                "code": "invalid_request",
            }
        })),
    )
        .into_response()
}
