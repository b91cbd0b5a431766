use bytes::BytesMut;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::auth::TokenManager;
use crate::constants::{CAPACITY_MARKERS, ENVELOPE_USER_AGENT};
use crate::models::AppConfig;
use crate::proxy::call_log::{CallAccountInfo, CallLogger, CallRecord};
use crate::proxy::cooldown::parse_reset_hint;
use crate::store::UsageTokens;
use crate::util::synthesize_session_id;

/// How many stream chunks a single call-log record retains.
const LOGGED_CHUNK_LIMIT: usize = 32;

#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("capacity exhausted: {message}")]
    Capacity {
        message: String,
        reset_hint_secs: Option<u64>,
    },
    #[error("upstream closed the stream without emitting any events")]
    Empty,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("upstream returned {status}: {message}")]
    Status { status: u16, message: String },
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub body: Value,
    pub usage: Option<UsageTokens>,
}

#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub payload: Value,
    pub usage: Option<UsageTokens>,
}

/// Identity attached to every call-log record.
#[derive(Debug, Clone)]
pub struct CallMeta {
    pub model: String,
    pub account: CallAccountInfo,
}

pub type UpstreamEventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, UpstreamError>> + Send>>;

/// Build the shared outbound HTTP client: connect timeout and optional
/// forward proxy from config, no overall request timeout because streams
/// may be long-lived.
pub fn build_http_client(config: &AppConfig) -> Result<reqwest::Client, String> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(config.fetch_connect_timeout_ms))
        .pool_max_idle_per_host(16)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .user_agent(crate::constants::USER_AGENT.as_str());

    if let Some(url) = config.outbound_proxy_url.as_deref().filter(|u| !u.is_empty()) {
        let proxy =
            reqwest::Proxy::all(url).map_err(|e| format!("Invalid outbound proxy url: {}", e))?;
        builder = builder.proxy(proxy);
        tracing::info!("Outbound proxy enabled: {}", url);
    }

    builder
        .build()
        .map_err(|e| format!("Failed to build HTTP client: {}", e))
}

/// Wrap a caller body into the upstream envelope. The inner request is
/// carried opaquely; only `generationConfig.candidateCount` and
/// `sessionId` are normalised here.
pub fn build_envelope(
    project_id: &str,
    model: &str,
    image_model: &str,
    caller_body: &Value,
) -> Value {
    let mut inner = if caller_body.is_object() {
        caller_body.clone()
    } else {
        json!({})
    };
    let obj = inner.as_object_mut().expect("inner request is an object");

    let generation_config = obj.entry("generationConfig").or_insert_with(|| json!({}));
    if let Some(config) = generation_config.as_object_mut() {
        config.entry("candidateCount").or_insert(json!(1));
    }

    let has_session = obj.get("sessionId").is_some_and(|v| !v.is_null());
    if !has_session {
        obj.insert("sessionId".to_string(), json!(synthesize_session_id()));
    }

    let request_type = if model == image_model {
        "image_gen"
    } else {
        "agent"
    };

    json!({
        "project": project_id,
        "requestId": format!("agent-{}", Uuid::new_v4()),
        "request": inner,
        "model": model,
        "userAgent": ENVELOPE_USER_AGENT,
        "requestType": request_type,
    })
}

/// Flatten `{response: {...}, traceId}` into the inner object, keeping
/// `traceId` when the inner object lacks one.
pub fn unwrap_response(raw: &Value) -> Value {
    match raw.get("response") {
        Some(inner) => {
            let mut flat = inner.clone();
            if let (Some(trace_id), Some(obj)) = (raw.get("traceId"), flat.as_object_mut()) {
                if !obj.contains_key("traceId") {
                    obj.insert("traceId".to_string(), trace_id.clone());
                }
            }
            flat
        }
        None => raw.clone(),
    }
}

/// Pull the authoritative token counts out of an unwrapped event, if the
/// chunk carries them.
pub fn extract_usage(event: &Value) -> Option<UsageTokens> {
    let meta = event.get("usageMetadata")?;
    Some(UsageTokens {
        prompt_tokens: meta.get("promptTokenCount").and_then(Value::as_i64).unwrap_or(0),
        completion_tokens: meta
            .get("candidatesTokenCount")
            .and_then(Value::as_i64)
            .unwrap_or(0),
        total_tokens: meta.get("totalTokenCount").and_then(Value::as_i64).unwrap_or(0),
        thinking_tokens: meta
            .get("thoughtsTokenCount")
            .and_then(Value::as_i64)
            .unwrap_or(0),
    })
}

/// 429 is always capacity; otherwise the body has to carry one of the
/// known marker phrases.
fn classify_failure(status: u16, body: &str) -> UpstreamError {
    let is_capacity = status == 429 || CAPACITY_MARKERS.iter().any(|m| body.contains(m));
    if is_capacity {
        UpstreamError::Capacity {
            message: body.to_string(),
            reset_hint_secs: parse_reset_hint(body),
        }
    } else {
        UpstreamError::Status {
            status,
            message: body.to_string(),
        }
    }
}

/// Error events can also arrive inside an otherwise-200 SSE stream.
fn classify_stream_error(payload: &Value) -> UpstreamError {
    let code = payload
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as u16;
    let message = payload
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| payload.to_string());
    classify_failure(code, &message)
}

pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenManager>,
    call_log: Arc<CallLogger>,
}

impl UpstreamClient {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        tokens: Arc<TokenManager>,
        call_log: Arc<CallLogger>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            tokens,
            call_log,
        }
    }

    fn build_url(&self, method: &str, query: Option<&str>) -> String {
        match query {
            Some(qs) => format!("{}:{}?{}", self.base_url, method, qs),
            None => format!("{}:{}", self.base_url, method),
        }
    }

    async fn post_with_refresh_retry(
        &self,
        url: &str,
        meta: &CallMeta,
        access_token: &str,
        envelope: &Value,
    ) -> Result<reqwest::Response, UpstreamError> {
        let mut token = access_token.to_string();
        let mut refreshed = false;
        loop {
            let response = self
                .client
                .post(url)
                .bearer_auth(&token)
                .json(envelope)
                .send()
                .await
                .map_err(|e| UpstreamError::Transport(e.to_string()))?;

            if response.status() == reqwest::StatusCode::UNAUTHORIZED && !refreshed {
                refreshed = true;
                tracing::debug!(
                    "Upstream rejected token for account {}, forcing refresh",
                    meta.account.id
                );
                match self.tokens.force_refresh(meta.account.id).await {
                    Ok(snapshot) => {
                        token = snapshot.access_token;
                        continue;
                    }
                    Err(e) => {
                        return Err(UpstreamError::Status {
                            status: 401,
                            message: format!("token refresh after 401 failed: {}", e),
                        })
                    }
                }
            }
            return Ok(response);
        }
    }

    /// Non-streaming generation. Retries once on 401 after a forced
    /// refresh; classifies capacity signals; unwraps the response.
    pub async fn chat(
        &self,
        meta: &CallMeta,
        access_token: &str,
        envelope: Value,
    ) -> Result<ChatOutcome, UpstreamError> {
        let url = self.build_url("generateContent", None);
        let started = Instant::now();

        let result = self
            .post_with_refresh_retry(&url, meta, access_token, &envelope)
            .await;

        let mut record = CallRecord::new("chat", "generateContent", &meta.model);
        record.account = Some(meta.account.clone());
        record.request = Some(envelope.clone());

        let outcome = match result {
            Err(e) => Err(e),
            Ok(response) => {
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    Err(classify_failure(status.as_u16(), &body))
                } else {
                    match response.json::<Value>().await {
                        Err(e) => Err(UpstreamError::Transport(format!(
                            "response parse failed: {}",
                            e
                        ))),
                        Ok(raw) => {
                            let flat = unwrap_response(&raw);
                            let usage = extract_usage(&flat);
                            Ok(ChatOutcome { body: flat, usage })
                        }
                    }
                }
            }
        };

        record.latency_ms = started.elapsed().as_millis() as i64;
        match &outcome {
            Ok(result) => {
                record.response = Some(result.body.clone());
            }
            Err(e) => {
                record.status = "error".to_string();
                record.error = Some(json!({"message": e.to_string()}));
            }
        }
        self.call_log.record(record);

        outcome
    }

    /// Streaming generation. The returned stream yields decoded events in
    /// upstream order; dropping it aborts the underlying connection. A
    /// clean close with zero events yields `Empty` as the only item.
    pub async fn stream_chat(
        &self,
        meta: &CallMeta,
        access_token: &str,
        envelope: Value,
    ) -> Result<UpstreamEventStream, UpstreamError> {
        let url = self.build_url("streamGenerateContent", Some("alt=sse"));
        let started = Instant::now();

        let response = self
            .post_with_refresh_retry(&url, meta, access_token, &envelope)
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = classify_failure(status.as_u16(), &body);
            let mut record = CallRecord::new("chat_stream", "streamGenerateContent", &meta.model);
            record.stream = true;
            record.account = Some(meta.account.clone());
            record.request = Some(envelope);
            record.status = "error".to_string();
            record.latency_ms = started.elapsed().as_millis() as i64;
            record.error = Some(json!({"message": error.to_string()}));
            self.call_log.record(record);
            return Err(error);
        }

        let call_log = self.call_log.clone();
        let meta = meta.clone();
        let mut byte_stream = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut buffer = BytesMut::new();
            let mut emitted: usize = 0;
            let mut logged_chunks: Vec<Value> = Vec::new();
            let mut terminal_error: Option<UpstreamError> = None;

            'outer: loop {
                let chunk = match byte_stream.next().await {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        terminal_error = Some(UpstreamError::Transport(e.to_string()));
                        break;
                    }
                    None => break,
                };
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line_raw = buffer.split_to(pos + 1);
                    let Ok(line_str) = std::str::from_utf8(&line_raw) else {
                        call_log.record_invalid_chunk(&meta.model, "<non-utf8 line>");
                        continue;
                    };
                    let line = line_str.trim();
                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        continue;
                    }

                    match serde_json::from_str::<Value>(data) {
                        Ok(raw) => {
                            let flat = unwrap_response(&raw);
                            if flat.get("error").is_some() {
                                terminal_error = Some(classify_stream_error(&flat));
                                break 'outer;
                            }
                            let usage = extract_usage(&flat);
                            emitted += 1;
                            if logged_chunks.len() < LOGGED_CHUNK_LIMIT {
                                logged_chunks.push(flat.clone());
                            }
                            yield Ok(StreamEvent { payload: flat, usage });
                        }
                        Err(e) => {
                            // Permissive: a malformed chunk is dropped, not fatal.
                            tracing::debug!("Dropping non-JSON stream chunk: {}", e);
                            call_log.record_invalid_chunk(&meta.model, data);
                        }
                    }
                }
            }

            if terminal_error.is_none() && emitted == 0 {
                terminal_error = Some(UpstreamError::Empty);
            }

            let mut record = CallRecord::new("chat_stream", "streamGenerateContent", &meta.model);
            record.stream = true;
            record.account = Some(meta.account.clone());
            record.latency_ms = started.elapsed().as_millis() as i64;
            record.chunks = Some(logged_chunks);
            if let Some(error) = &terminal_error {
                record.status = "error".to_string();
                record.error = Some(json!({"message": error.to_string()}));
            }
            call_log.record(record);

            if let Some(error) = terminal_error {
                yield Err(error);
            }
        };

        Ok(Box::pin(stream))
    }
}
