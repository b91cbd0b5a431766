use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::auth::TokenError;
use crate::models::AccountSummary;
use crate::proxy::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub email: Option<String>,
    pub refresh_token: String,
}

/// Create an account and run its onboarding sequence; only an account
/// that completed onboarding becomes eligible for selection.
pub async fn create_account(
    State(state): State<AppState>,
    Json(request): Json<CreateAccountRequest>,
) -> Response {
    let account = match state
        .store
        .insert_account(request.email.as_deref(), &request.refresh_token)
    {
        Ok(account) => account,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": e}))).into_response();
        }
    };

    match state.tokens.initialize_account(account.id).await {
        Ok(initialized) => {
            if let Err(e) = state.pool.reload_account(initialized.id) {
                tracing::warn!("Pool reload after account create failed: {}", e);
            }
            (
                StatusCode::CREATED,
                Json(AccountSummary::from(&initialized)),
            )
                .into_response()
        }
        Err(TokenError::Duplicate(project)) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": format!("duplicate account: project {} is already bound", project)
            })),
        )
            .into_response(),
        Err(e) => {
            // The row stays; it is not selectable until onboarding
            // succeeds on a later attempt.
            let _ = state.pool.reload_account(account.id);
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": e.to_string(), "account_id": account.id})),
            )
                .into_response()
        }
    }
}

pub async fn list_accounts(State(state): State<AppState>) -> Response {
    match state.store.list_accounts() {
        Ok(accounts) => {
            let summaries: Vec<AccountSummary> =
                accounts.iter().map(AccountSummary::from).collect();
            Json(summaries).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e}))).into_response(),
    }
}

pub async fn delete_account(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.store.delete_account(id) {
        Ok(true) => {
            state.pool.remove_account(id);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("account {} not found", id)})),
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e}))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub label: Option<String>,
}

pub async fn create_api_key(
    State(state): State<AppState>,
    Json(request): Json<CreateApiKeyRequest>,
) -> Response {
    match state.store.create_api_key(request.label.as_deref()) {
        Ok(key) => (StatusCode::CREATED, Json(key)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e}))).into_response(),
    }
}

pub async fn list_api_keys(State(state): State<AppState>) -> Response {
    match state.store.list_api_keys() {
        Ok(keys) => Json(keys).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e}))).into_response(),
    }
}

pub async fn delete_api_key(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.store.delete_api_key(id) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("api key {} not found", id)})),
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e}))).into_response(),
    }
}

pub async fn call_log_snapshot(State(state): State<AppState>) -> Response {
    Json(state.call_log.snapshot()).into_response()
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_log_limit")]
    pub limit: usize,
}

fn default_log_limit() -> usize {
    100
}

pub async fn recent_request_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Response {
    match state.store.recent_request_logs(query.limit.min(1_000)) {
        Ok(logs) => Json(logs).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e}))).into_response(),
    }
}
