use axum::{
    middleware::from_fn_with_state,
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

use crate::proxy::state::AppState;
use crate::proxy::{admin, dispatcher, middleware};

async fn health() -> &'static str {
    "ok"
}

pub fn build_router(state: AppState) -> Router {
    let proxy_routes = Router::new()
        .route(
            "/v1/chat/completions",
            post(dispatcher::handle_chat_completions),
        )
        .route(
            "/v1beta/models/:model_action",
            post(dispatcher::handle_native_generate),
        )
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::api_key_auth_middleware,
        ));

    let admin_routes = Router::new()
        .route(
            "/accounts",
            post(admin::create_account).get(admin::list_accounts),
        )
        .route("/accounts/:id", delete(admin::delete_account))
        .route(
            "/api-keys",
            post(admin::create_api_key).get(admin::list_api_keys),
        )
        .route("/api-keys/:id", delete(admin::delete_api_key))
        .route("/call-log", get(admin::call_log_snapshot))
        .route("/request-logs", get(admin::recent_request_logs))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::admin_auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(proxy_routes)
        .nest("/admin", admin_routes)
        .with_state(state)
}

pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), String> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("failed_to_bind {}: {}", addr, e))?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| format!("server_exited_with_error: {}", e))
}
