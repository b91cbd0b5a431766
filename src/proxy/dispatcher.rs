use axum::{
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    Extension, Json,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::proxy::call_log::CallAccountInfo;
use crate::proxy::errors;
use crate::proxy::limiter::ModelRateLimiter;
use crate::proxy::middleware::ApiKeyIdentity;
use crate::proxy::pool::{AccountPool, PoolError};
use crate::proxy::state::AppState;
use crate::proxy::streaming::{
    build_json_response, build_sse_response, sse_data_frame, sse_done_frame, sse_error_frame,
};
use crate::proxy::upstream::{build_envelope, CallMeta, UpstreamClient, UpstreamError};
use crate::store::{RequestLog, Store, UsageTokens};
use crate::util::{now_ms, sleep_cancellable};

/// Response framing for the two endpoint families. The chat dialect
/// terminates streams with `data: [DONE]`; the native dialect does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Native,
    Chat,
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub api_key_id: Option<i64>,
    pub model: String,
    pub dialect: Dialect,
}

impl RequestContext {
    pub fn new(model: String, dialect: Dialect, api_key_id: Option<i64>) -> Self {
        Self {
            request_id: format!("req-{}", Uuid::new_v4()),
            api_key_id,
            model,
            dialect,
        }
    }
}

/// Holds the model slot and account lock for one request. Release runs
/// exactly once, on drop, on every exit path including caller
/// disconnection; a request that dies before its log was written gets an
/// error row with "client disconnected".
struct RequestGuard {
    limiter: Arc<ModelRateLimiter>,
    pool: Arc<AccountPool>,
    store: Arc<Store>,
    request_id: String,
    api_key_id: Option<i64>,
    model: String,
    started: Instant,
    account_id: Option<i64>,
    attempt_no: i64,
    account_attempt: i64,
    same_retry: bool,
    log_written: bool,
}

impl RequestGuard {
    fn new(
        limiter: Arc<ModelRateLimiter>,
        pool: Arc<AccountPool>,
        store: Arc<Store>,
        ctx: &RequestContext,
    ) -> Self {
        Self {
            limiter,
            pool,
            store,
            request_id: ctx.request_id.clone(),
            api_key_id: ctx.api_key_id,
            model: ctx.model.clone(),
            started: Instant::now(),
            account_id: None,
            attempt_no: 1,
            account_attempt: 1,
            same_retry: false,
            log_written: false,
        }
    }

    fn write_log(&mut self, status: &str, usage: UsageTokens, error_message: Option<String>) {
        if self.log_written {
            return;
        }
        self.log_written = true;
        let log = RequestLog {
            request_id: self.request_id.clone(),
            account_id: self.account_id,
            api_key_id: self.api_key_id,
            model: self.model.clone(),
            usage,
            status: status.to_string(),
            latency_ms: self.started.elapsed().as_millis() as i64,
            error_message,
            attempt_no: self.attempt_no,
            account_attempt: self.account_attempt,
            same_retry: self.same_retry,
            created_at: now_ms(),
        };
        if let Err(e) = self.store.insert_request_log(&log) {
            tracing::warn!("Failed to write request log: {}", e);
        }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if !self.log_written {
            self.write_log(
                "error",
                UsageTokens::default(),
                Some("client disconnected".to_string()),
            );
        }
        if let Some(account_id) = self.account_id.take() {
            self.pool.unlock_account(account_id);
        }
        self.limiter.release(&self.model);
    }
}

/// The per-request state machine: slot, account, upstream call, retry
/// across accounts on capacity errors, release, log.
pub struct Dispatcher {
    pool: Arc<AccountPool>,
    limiter: Arc<ModelRateLimiter>,
    upstream: Arc<UpstreamClient>,
    store: Arc<Store>,
    capacity_retries: u32,
    capacity_retry_delay_ms: u64,
    image_model: String,
    shutdown: CancellationToken,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<AccountPool>,
        limiter: Arc<ModelRateLimiter>,
        upstream: Arc<UpstreamClient>,
        store: Arc<Store>,
        capacity_retries: u32,
        capacity_retry_delay_ms: u64,
        image_model: String,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pool,
            limiter,
            upstream,
            store,
            capacity_retries,
            capacity_retry_delay_ms,
            image_model,
            shutdown,
        }
    }

    fn max_attempts(&self) -> u32 {
        self.capacity_retries + 1
    }

    fn retry_delay(&self, reset_hint_secs: Option<u64>, attempt: u32) -> Duration {
        match reset_hint_secs {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_millis(self.capacity_retry_delay_ms * attempt as u64),
        }
    }

    /// Log a request that was rejected before it acquired any resources.
    fn log_rejected(&self, ctx: &RequestContext, message: &str) {
        let log = RequestLog {
            request_id: ctx.request_id.clone(),
            account_id: None,
            api_key_id: ctx.api_key_id,
            model: ctx.model.clone(),
            usage: UsageTokens::default(),
            status: "error".to_string(),
            latency_ms: 0,
            error_message: Some(message.to_string()),
            attempt_no: 1,
            account_attempt: 1,
            same_retry: false,
            created_at: now_ms(),
        };
        if let Err(e) = self.store.insert_request_log(&log) {
            tracing::warn!("Failed to write request log: {}", e);
        }
    }

    fn call_meta(&self, ctx: &RequestContext, lease: &crate::proxy::pool::LeasedAccount) -> CallMeta {
        CallMeta {
            model: ctx.model.clone(),
            account: CallAccountInfo {
                id: lease.account.id,
                email: lease.account.email.clone(),
                tier: Some(lease.token.tier.clone()),
            },
        }
    }

    /// Non-streaming request lifecycle.
    pub async fn generate(&self, ctx: RequestContext, body: Value) -> Response {
        if !self.limiter.try_acquire(&ctx.model) {
            self.log_rejected(&ctx, "Model concurrency limit reached");
            return errors::concurrency_limit_response();
        }
        let mut guard = RequestGuard::new(
            self.limiter.clone(),
            self.pool.clone(),
            self.store.clone(),
            &ctx,
        );

        let max_attempts = self.max_attempts();
        let mut previous_account: Option<i64> = None;
        let mut last_capacity_message = String::new();

        for attempt in 1..=max_attempts {
            guard.attempt_no = attempt as i64;

            let lease = match self.pool.get_best_account(&ctx.model, &self.shutdown).await {
                Ok(lease) => lease,
                Err(PoolError::Cancelled) => {
                    guard.write_log("error", UsageTokens::default(), Some("client disconnected".to_string()));
                    return errors::internal_error_response("request cancelled");
                }
                Err(e @ (PoolError::AllBusy | PoolError::AllLimited)) => {
                    let message = e.to_string();
                    guard.write_log("error", UsageTokens::default(), Some(message.clone()));
                    return errors::capacity_exhausted_response(&message);
                }
                Err(e @ PoolError::NoAccounts) => {
                    let message = e.to_string();
                    guard.write_log("error", UsageTokens::default(), Some(message.clone()));
                    return errors::internal_error_response(&message);
                }
                Err(PoolError::Token { account_id, source }) => {
                    // Charged against this caller's budget; the next loop
                    // iteration reselects on a different account.
                    tracing::warn!(
                        "Token failure on account {} during selection: {}",
                        account_id,
                        source
                    );
                    if attempt < max_attempts {
                        continue;
                    }
                    let message = source.to_string();
                    guard.write_log("error", UsageTokens::default(), Some(message.clone()));
                    return errors::internal_error_response(&message);
                }
            };

            let account_id = lease.account.id;
            guard.same_retry = previous_account == Some(account_id);
            guard.account_attempt = if guard.same_retry {
                guard.account_attempt + 1
            } else {
                1
            };
            previous_account = Some(account_id);
            guard.account_id = Some(account_id);

            let envelope = build_envelope(
                &lease.token.project_id,
                &ctx.model,
                &self.image_model,
                &body,
            );
            let meta = self.call_meta(&ctx, &lease);

            match self
                .upstream
                .chat(&meta, &lease.token.access_token, envelope)
                .await
            {
                Ok(outcome) => {
                    self.pool.mark_success(account_id, &ctx.model);
                    guard.write_log("success", outcome.usage.unwrap_or_default(), None);
                    return build_json_response(StatusCode::OK, &outcome.body);
                }
                Err(UpstreamError::Capacity {
                    message,
                    reset_hint_secs,
                }) => {
                    self.pool
                        .mark_capacity_limited(account_id, &ctx.model, &message);
                    self.pool.unlock_account(account_id);
                    guard.account_id = None;
                    last_capacity_message = message;

                    if attempt < max_attempts {
                        let delay = self.retry_delay(reset_hint_secs, attempt);
                        if !sleep_cancellable(delay, &self.shutdown).await {
                            guard.write_log(
                                "error",
                                UsageTokens::default(),
                                Some("client disconnected".to_string()),
                            );
                            return errors::internal_error_response("request cancelled");
                        }
                        continue;
                    }
                    let message =
                        format!("All accounts exhausted: {}", last_capacity_message);
                    guard.write_log("error", UsageTokens::default(), Some(message.clone()));
                    return errors::capacity_exhausted_response(&message);
                }
                Err(e) => {
                    let message = e.to_string();
                    self.pool.mark_account_error(account_id, &message);
                    guard.write_log("error", UsageTokens::default(), Some(message.clone()));
                    return errors::internal_error_response(&message);
                }
            }
        }

        let message = format!("All accounts exhausted: {}", last_capacity_message);
        guard.write_log("error", UsageTokens::default(), Some(message.clone()));
        errors::capacity_exhausted_response(&message)
    }

    /// Streaming request lifecycle. Headers are committed up front; the
    /// attempt loop runs inside the body stream, and once a single event
    /// has been flushed no retry happens on any error.
    pub async fn stream_generate(self: &Arc<Self>, ctx: RequestContext, body: Value) -> Response {
        if !self.limiter.try_acquire(&ctx.model) {
            self.log_rejected(&ctx, "Model concurrency limit reached");
            return errors::concurrency_limit_response();
        }
        let mut guard = RequestGuard::new(
            self.limiter.clone(),
            self.pool.clone(),
            self.store.clone(),
            &ctx,
        );

        let this = self.clone();
        let stream = async_stream::stream! {
            let max_attempts = this.max_attempts();
            let chat_dialect = ctx.dialect == Dialect::Chat;
            let mut previous_account: Option<i64> = None;

            for attempt in 1..=max_attempts {
                guard.attempt_no = attempt as i64;

                let lease = match this.pool.get_best_account(&ctx.model, &this.shutdown).await {
                    Ok(lease) => lease,
                    Err(PoolError::Cancelled) => {
                        guard.write_log("error", UsageTokens::default(), Some("client disconnected".to_string()));
                        return;
                    }
                    Err(e @ (PoolError::AllBusy | PoolError::AllLimited)) => {
                        let message = e.to_string();
                        guard.write_log("error", UsageTokens::default(), Some(message.clone()));
                        yield Ok::<_, String>(sse_error_frame(&message, ErrorCode::RateLimitExceeded));
                        return;
                    }
                    Err(e @ PoolError::NoAccounts) => {
                        let message = e.to_string();
                        guard.write_log("error", UsageTokens::default(), Some(message.clone()));
                        yield Ok(sse_error_frame(&message, ErrorCode::InternalError));
                        return;
                    }
                    Err(PoolError::Token { account_id, source }) => {
                        tracing::warn!(
                            "Token failure on account {} during selection: {}",
                            account_id,
                            source
                        );
                        if attempt < max_attempts {
                            continue;
                        }
                        let message = source.to_string();
                        guard.write_log("error", UsageTokens::default(), Some(message.clone()));
                        yield Ok(sse_error_frame(&message, ErrorCode::InternalError));
                        return;
                    }
                };

                let account_id = lease.account.id;
                guard.same_retry = previous_account == Some(account_id);
                guard.account_attempt = if guard.same_retry {
                    guard.account_attempt + 1
                } else {
                    1
                };
                previous_account = Some(account_id);
                guard.account_id = Some(account_id);

                let envelope = build_envelope(
                    &lease.token.project_id,
                    &ctx.model,
                    &this.image_model,
                    &body,
                );
                let meta = this.call_meta(&ctx, &lease);

                let mut events = match this
                    .upstream
                    .stream_chat(&meta, &lease.token.access_token, envelope)
                    .await
                {
                    Ok(events) => events,
                    Err(UpstreamError::Capacity { message, reset_hint_secs }) => {
                        this.pool.mark_capacity_limited(account_id, &ctx.model, &message);
                        this.pool.unlock_account(account_id);
                        guard.account_id = None;
                        if attempt < max_attempts {
                            let delay = this.retry_delay(reset_hint_secs, attempt);
                            if !sleep_cancellable(delay, &this.shutdown).await {
                                guard.write_log("error", UsageTokens::default(), Some("client disconnected".to_string()));
                                return;
                            }
                            continue;
                        }
                        guard.write_log("error", UsageTokens::default(), Some(message.clone()));
                        yield Ok(sse_error_frame(&message, ErrorCode::RateLimitExceeded));
                        return;
                    }
                    Err(e) => {
                        let message = e.to_string();
                        this.pool.mark_account_error(account_id, &message);
                        guard.write_log("error", UsageTokens::default(), Some(message.clone()));
                        yield Ok(sse_error_frame(&message, ErrorCode::InternalError));
                        return;
                    }
                };

                let mut emitted = false;
                let mut usage: Option<UsageTokens> = None;
                let mut stream_done = false;

                while let Some(item) = futures::StreamExt::next(&mut events).await {
                    match item {
                        Ok(event) => {
                            if let Some(u) = event.usage {
                                usage = Some(u);
                            }
                            emitted = true;
                            yield Ok(sse_data_frame(&event.payload));
                        }
                        Err(UpstreamError::Capacity { message, reset_hint_secs }) => {
                            this.pool.mark_capacity_limited(account_id, &ctx.model, &message);
                            // The client has observed part of this attempt's
                            // transcript; switching accounts now would splice
                            // two transcripts together.
                            if !emitted && attempt < max_attempts {
                                drop(events);
                                this.pool.unlock_account(account_id);
                                guard.account_id = None;
                                let delay = this.retry_delay(reset_hint_secs, attempt);
                                if !sleep_cancellable(delay, &this.shutdown).await {
                                    guard.write_log("error", UsageTokens::default(), Some("client disconnected".to_string()));
                                    return;
                                }
                                stream_done = false;
                                break;
                            }
                            guard.write_log("error", usage.take().unwrap_or_default(), Some(message.clone()));
                            yield Ok(sse_error_frame(&message, ErrorCode::RateLimitExceeded));
                            return;
                        }
                        Err(UpstreamError::Empty) => {
                            this.pool.mark_account_error(account_id, "empty upstream response");
                            guard.write_log("error", UsageTokens::default(), Some("empty upstream response".to_string()));
                            yield Ok(sse_error_frame(
                                "Upstream closed the stream without emitting any events",
                                ErrorCode::EmptyUpstreamResponse,
                            ));
                            return;
                        }
                        Err(e) => {
                            let message = e.to_string();
                            this.pool.mark_account_error(account_id, &message);
                            guard.write_log("error", usage.take().unwrap_or_default(), Some(message.clone()));
                            yield Ok(sse_error_frame(&message, ErrorCode::InternalError));
                            return;
                        }
                    }
                    stream_done = true;
                }

                if stream_done {
                    this.pool.mark_success(account_id, &ctx.model);
                    guard.write_log("success", usage.unwrap_or_default(), None);
                    if chat_dialect {
                        yield Ok(sse_done_frame());
                    }
                    return;
                }
                // Otherwise: capacity retry before any emission; next attempt.
            }

            guard.write_log("error", UsageTokens::default(), Some("All accounts exhausted".to_string()));
            yield Ok(sse_error_frame("All accounts exhausted", ErrorCode::RateLimitExceeded));
        };

        build_sse_response(Body::from_stream(stream))
    }
}

// ---- axum handlers ----

/// Native dialect: `POST /v1beta/models/{model}:generateContent` and
/// `:streamGenerateContent`.
pub async fn handle_native_generate(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    Extension(identity): Extension<ApiKeyIdentity>,
    Json(body): Json<Value>,
) -> Response {
    let (caller_model, action) = match model_action.rsplit_once(':') {
        Some((model, action)) => (model.to_string(), action.to_string()),
        None => (model_action, "generateContent".to_string()),
    };
    let model = state.resolve_model(&caller_model).await;
    let ctx = RequestContext::new(model, Dialect::Native, Some(identity.key_id));

    tracing::info!(
        "[Dispatch] {} {} via key {} ({})",
        action,
        ctx.model,
        identity.key_id,
        ctx.request_id
    );

    match action.as_str() {
        "generateContent" => state.dispatcher.generate(ctx, body).await,
        "streamGenerateContent" => state.dispatcher.stream_generate(ctx, body).await,
        other => errors::bad_request_response(&format!("Unsupported method: {}", other)),
    }
}

/// Chat dialect: `POST /v1/chat/completions`. Body conversion is
/// delegated to the configured translator.
pub async fn handle_chat_completions(
    State(state): State<AppState>,
    Extension(identity): Extension<ApiKeyIdentity>,
    Json(body): Json<Value>,
) -> Response {
    let Some(caller_model) = body.get("model").and_then(Value::as_str) else {
        return errors::bad_request_response("request body is missing 'model'");
    };
    let wants_stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let inner = match state.translator.to_upstream(&body) {
        Ok(inner) => inner,
        Err(e) => return errors::bad_request_response(&e),
    };

    let model = state.resolve_model(caller_model).await;
    let ctx = RequestContext::new(model, Dialect::Chat, Some(identity.key_id));

    tracing::info!(
        "[Dispatch] chat/completions {} stream={} ({})",
        ctx.model,
        wants_stream,
        ctx.request_id
    );

    if wants_stream {
        state.dispatcher.stream_generate(ctx, inner).await
    } else {
        state.dispatcher.generate(ctx, inner).await
    }
}
