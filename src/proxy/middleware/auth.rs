use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::proxy::errors;
use crate::proxy::state::AppState;
use crate::util::now_ms;

/// Caller identity attached to the request after a successful API key
/// lookup; the dispatcher stamps it into the request log.
#[derive(Clone, Debug)]
pub struct ApiKeyIdentity {
    pub key_id: i64,
    pub label: Option<String>,
}

fn constant_time_str_eq(left: &str, right: &str) -> bool {
    let left_bytes = left.as_bytes();
    let right_bytes = right.as_bytes();
    let max_len = left_bytes.len().max(right_bytes.len());
    let mut diff = left_bytes.len() ^ right_bytes.len();

    for i in 0..max_len {
        let l = left_bytes.get(i).copied().unwrap_or(0);
        let r = right_bytes.get(i).copied().unwrap_or(0);
        diff |= (l ^ r) as usize;
    }

    diff == 0
}

fn extract_bearer(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer ").or(Some(s)))
        .or_else(|| {
            request
                .headers()
                .get("x-api-key")
                .and_then(|h| h.to_str().ok())
        })
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Authenticate proxy callers against the `api_keys` table and attach the
/// key identity for logging.
pub async fn api_key_auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(provided) = extract_bearer(&request) else {
        return Ok(errors::unauthorized_response());
    };

    match state.store.get_api_key_by_value(provided) {
        Ok(Some(key)) if key.enabled => {
            let _ = state.store.touch_api_key(key.id, now_ms());
            let identity = ApiKeyIdentity {
                key_id: key.id,
                label: key.label,
            };
            let (mut parts, body) = request.into_parts();
            parts.extensions.insert(identity);
            Ok(next.run(Request::from_parts(parts, body)).await)
        }
        Ok(_) => {
            tracing::debug!("Rejected request with unknown or disabled API key");
            Ok(errors::unauthorized_response())
        }
        Err(e) => {
            tracing::error!("API key lookup failed: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Admin routes authenticate against the configured admin key only. With
/// no admin key configured every request is denied.
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let expected = match state.config.admin_key.as_deref() {
        Some(key) if !key.is_empty() => key,
        _ => {
            tracing::warn!("Admin request rejected: no admin_key configured");
            return Err(StatusCode::UNAUTHORIZED);
        }
    };
    let authorized = extract_bearer(&request)
        .map(|provided| constant_time_str_eq(provided, expected))
        .unwrap_or(false);
    if authorized {
        Ok(next.run(request).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}
