//! End-to-end scenarios against a mock upstream: full router, real
//! store, real pool/limiter/dispatcher wiring.

use axum::response::IntoResponse;
use axum::{extract::State as AxumState, routing::post, Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::auth::{CodeAssistOnboarding, OauthClient, TokenManager};
use crate::models::AppConfig;
use crate::proxy::call_log::CallLogger;
use crate::proxy::dispatcher::Dispatcher;
use crate::proxy::limiter::ModelRateLimiter;
use crate::proxy::pool::AccountPool;
use crate::proxy::server::build_router;
use crate::proxy::state::AppState;
use crate::proxy::translate::PassthroughTranslator;
use crate::store::{test_store, Store};
use crate::util::now_ms;

struct Harness {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    store: Arc<Store>,
    pool: Arc<AccountPool>,
    limiter: Arc<ModelRateLimiter>,
    call_log: Arc<CallLogger>,
    servers: Vec<tokio::task::JoinHandle<()>>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        for server in &self.servers {
            server.abort();
        }
    }
}

async fn spawn_listener(app: Router) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, handle)
}

async fn spawn_harness(upstream: Router, tweak: impl FnOnce(&mut AppConfig)) -> Harness {
    let mut config = AppConfig::default();
    config.capacity_retry_delay_ms = 50;
    config.account_wait_ms = 400;
    tweak(&mut config);

    let store = Arc::new(test_store("e2e"));

    let token_app = Router::new().route(
        "/token",
        post(|| async { Json(json!({"access_token": "at", "expires_in": 3600})) }),
    );
    let (token_addr, token_server) = spawn_listener(token_app).await;
    let (upstream_addr, upstream_server) = spawn_listener(upstream).await;

    let http = reqwest::Client::new();
    let oauth = Arc::new(OauthClient::new(
        http.clone(),
        format!("http://{}/token", token_addr),
        "cid",
        None,
    ));
    let onboarding = Arc::new(CodeAssistOnboarding::new(
        http.clone(),
        "http://127.0.0.1:1/v1internal",
    ));
    let tokens = Arc::new(TokenManager::new(
        store.clone(),
        oauth,
        onboarding,
        config.token_refresh_skew_ms,
    ));
    let call_log = Arc::new(CallLogger::new(config.call_log_capacity));
    let upstream_client = Arc::new(crate::proxy::upstream::UpstreamClient::new(
        http,
        format!("http://{}/v1internal", upstream_addr),
        tokens.clone(),
        call_log.clone(),
    ));
    let pool = Arc::new(AccountPool::new(
        store.clone(),
        tokens.clone(),
        config.preferred_tiers.clone(),
        config.error_threshold,
        config.account_wait_ms,
    ));
    let limiter = Arc::new(ModelRateLimiter::new(
        config.default_model_concurrency,
        config.model_concurrency.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        limiter.clone(),
        upstream_client,
        store.clone(),
        config.capacity_retries,
        config.capacity_retry_delay_ms,
        config.image_model.clone(),
        CancellationToken::new(),
    ));

    let aliases = config.model_aliases.clone();
    let state = AppState {
        config: Arc::new(config),
        store: store.clone(),
        tokens,
        pool: pool.clone(),
        call_log: call_log.clone(),
        dispatcher,
        translator: Arc::new(PassthroughTranslator),
        aliases: Arc::new(tokio::sync::RwLock::new(aliases)),
    };

    let (app_addr, app_server) = spawn_listener(build_router(state)).await;
    let api_key = store.create_api_key(Some("test")).unwrap().token;

    Harness {
        base_url: format!("http://{}", app_addr),
        api_key,
        client: reqwest::Client::new(),
        store,
        pool,
        limiter,
        call_log,
        servers: vec![token_server, upstream_server, app_server],
    }
}

/// Insert a ready-to-serve account with a live token and a fixed project.
fn add_ready_account(store: &Store, email: &str, project: &str, tier: &str) -> i64 {
    let account = store.insert_account(Some(email), "rt").unwrap();
    store.set_onboarding(account.id, project, tier).unwrap();
    store
        .update_access_token(account.id, "at-live", now_ms() + 3_600_000)
        .unwrap();
    account.id
}

fn native_body() -> Value {
    json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]})
}

impl Harness {
    async fn post_generate(&self, model: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url, model
            ))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .expect("request")
    }

    async fn post_stream_generate(&self, model: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(format!(
                "{}/v1beta/models/{}:streamGenerateContent",
                self.base_url, model
            ))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .expect("request")
    }
}

#[derive(Clone)]
struct ProjectBehavior {
    hits: Arc<AtomicUsize>,
    /// project id -> reply kind
    replies: Arc<HashMap<String, Value>>,
}

async fn project_keyed_handler(
    AxumState(state): AxumState<ProjectBehavior>,
    Json(envelope): Json<Value>,
) -> axum::response::Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let project = envelope
        .get("project")
        .and_then(Value::as_str)
        .unwrap_or_default();
    match state.replies.get(project) {
        Some(reply) if reply.get("__capacity").is_some() => (
            axum::http::StatusCode::TOO_MANY_REQUESTS,
            reply["__capacity"].as_str().unwrap_or("").to_string(),
        )
            .into_response(),
        Some(reply) => Json(reply.clone()).into_response(),
        None => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "no behavior").into_response(),
    }
}

fn project_keyed_upstream(replies: HashMap<String, Value>) -> (Router, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let state = ProjectBehavior {
        hits: hits.clone(),
        replies: Arc::new(replies),
    };
    let router = Router::new()
        .route("/v1internal:generateContent", post(project_keyed_handler))
        .with_state(state);
    (router, hits)
}

#[tokio::test]
async fn happy_path_non_streaming_unwraps_and_logs() {
    let mut replies = HashMap::new();
    replies.insert(
        "proj-a".to_string(),
        json!({
            "response": {
                "candidates": [{"content": {"parts": [{"text": "hello"}]}}],
                "usageMetadata": {"totalTokenCount": 12, "promptTokenCount": 3}
            },
            "traceId": "t-1"
        }),
    );
    let (upstream, _hits) = project_keyed_upstream(replies);
    let harness = spawn_harness(upstream, |_| {}).await;
    let account = add_ready_account(&harness.store, "a@test", "proj-a", "standard-tier");
    harness.pool.load_from_store().unwrap();

    let response = harness
        .post_generate("gemini-2.0-flash", &native_body())
        .await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert!(body.get("candidates").is_some());
    assert!(body.get("response").is_none());
    assert_eq!(body["traceId"], "t-1");
    assert_eq!(body["usageMetadata"]["totalTokenCount"], 12);

    let logs = harness.store.recent_request_logs(10).unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, "success");
    assert_eq!(logs[0].account_id, Some(account));
    assert_eq!(logs[0].usage.total_tokens, 12);
    assert_eq!(logs[0].attempt_no, 1);
    assert!(logs[0].api_key_id.is_some());

    // Slot and lock are back.
    assert_eq!(harness.limiter.in_flight("gemini-2.0-flash"), 0);
    assert_eq!(harness.pool.locked_count(), 0);
    assert_eq!(harness.call_log.len(), 1);
}

#[tokio::test]
async fn slot_full_rejects_second_request_with_429() {
    // The single slot is held by a request parked on a slow upstream.
    let gate = Arc::new(tokio::sync::Notify::new());
    let gate_handler = gate.clone();
    let upstream = Router::new().route(
        "/v1internal:generateContent",
        post(move || {
            let gate = gate_handler.clone();
            async move {
                gate.notified().await;
                Json(json!({"response": {"candidates": []}}))
            }
        }),
    );
    let harness = spawn_harness(upstream, |config| {
        config.model_concurrency.insert("m".to_string(), 1);
    })
    .await;
    add_ready_account(&harness.store, "a@test", "proj-a", "free-tier");
    harness.pool.load_from_store().unwrap();

    let first = {
        let client = harness.client.clone();
        let url = format!("{}/v1beta/models/m:generateContent", harness.base_url);
        let key = harness.api_key.clone();
        let body = native_body();
        tokio::spawn(async move {
            client
                .post(url)
                .bearer_auth(key)
                .json(&body)
                .send()
                .await
                .expect("first request")
        })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(harness.limiter.in_flight("m"), 1);

    let second = harness.post_generate("m", &native_body()).await;
    assert_eq!(second.status(), 429);
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["error"]["code"], "model_concurrency_limit");
    assert_eq!(
        body["error"]["message"],
        "Model concurrency limit reached, please retry later"
    );

    let logs = harness.store.recent_request_logs(10).unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, "error");
    assert_eq!(
        logs[0].error_message.as_deref(),
        Some("Model concurrency limit reached")
    );

    gate.notify_one();
    let first = first.await.unwrap();
    assert_eq!(first.status(), 200);
}

#[tokio::test]
async fn capacity_error_retries_on_the_next_account() {
    let mut replies = HashMap::new();
    replies.insert(
        "proj-a".to_string(),
        json!({"__capacity": "You have exhausted your capacity on this model."}),
    );
    replies.insert(
        "proj-b".to_string(),
        json!({"response": {"candidates": [{"index": 0}], "usageMetadata": {"totalTokenCount": 5}}}),
    );
    let (upstream, hits) = project_keyed_upstream(replies);
    let harness = spawn_harness(upstream, |config| {
        config.capacity_retries = 2;
    })
    .await;
    let a = add_ready_account(&harness.store, "a@test", "proj-a", "free-tier");
    let b = add_ready_account(&harness.store, "b@test", "proj-b", "free-tier");
    // Make A the LRU choice so it is attempted first.
    harness.store.touch_last_used(a, 1).unwrap();
    harness.store.touch_last_used(b, 2).unwrap();
    harness.pool.load_from_store().unwrap();

    let response = harness.post_generate("m", &native_body()).await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["candidates"][0]["index"], 0);

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(harness.pool.cooldown_until(a, "m").is_some());
    assert!(harness.pool.cooldown_until(b, "m").is_none());

    let logs = harness.store.recent_request_logs(10).unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, "success");
    assert_eq!(logs[0].account_id, Some(b));
    assert_eq!(logs[0].attempt_no, 2);
    assert!(!logs[0].same_retry);
}

#[tokio::test]
async fn reset_hint_sets_precise_cooldown_expiry() {
    let mut replies = HashMap::new();
    replies.insert(
        "proj-a".to_string(),
        json!({"__capacity": "Resource has been exhausted reset after 1s"}),
    );
    replies.insert(
        "proj-b".to_string(),
        json!({"response": {"candidates": []}}),
    );
    let (upstream, _hits) = project_keyed_upstream(replies);
    let harness = spawn_harness(upstream, |_| {}).await;
    let a = add_ready_account(&harness.store, "a@test", "proj-a", "free-tier");
    let b = add_ready_account(&harness.store, "b@test", "proj-b", "free-tier");
    harness.store.touch_last_used(a, 1).unwrap();
    harness.store.touch_last_used(b, 2).unwrap();
    harness.pool.load_from_store().unwrap();

    let before = now_ms();
    let response = harness.post_generate("m", &native_body()).await;
    assert_eq!(response.status(), 200);

    // Hint of 1s plus the cushion: expiry lands ~2s after the hit.
    let until = harness.pool.cooldown_until(a, "m").expect("cooldown set");
    assert!(until >= before + 2_000);
    assert!(until <= now_ms() + 2_000);
}

#[tokio::test]
async fn all_accounts_exhausted_returns_rate_limit_error() {
    let mut replies = HashMap::new();
    replies.insert(
        "proj-a".to_string(),
        json!({"__capacity": "No capacity available"}),
    );
    replies.insert(
        "proj-b".to_string(),
        json!({"__capacity": "No capacity available"}),
    );
    let (upstream, hits) = project_keyed_upstream(replies);
    let harness = spawn_harness(upstream, |config| {
        config.capacity_retries = 1;
    })
    .await;
    let a = add_ready_account(&harness.store, "a@test", "proj-a", "free-tier");
    let b = add_ready_account(&harness.store, "b@test", "proj-b", "free-tier");
    harness.pool.load_from_store().unwrap();

    let response = harness.post_generate("m", &native_body()).await;
    assert_eq!(response.status(), 429);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "rate_limit_exceeded");

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(harness.pool.cooldown_until(a, "m").is_some());
    assert!(harness.pool.cooldown_until(b, "m").is_some());

    let logs = harness.store.recent_request_logs(10).unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, "error");
    assert_eq!(logs[0].attempt_no, 2);
    assert_eq!(harness.limiter.in_flight("m"), 0);
    assert_eq!(harness.pool.locked_count(), 0);
}

const MID_FAILURE_SSE: &str = concat!(
    "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"a\"}]}}]}}\n\n",
    "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"b\"}]}}],\"usageMetadata\":{\"totalTokenCount\":7}}}\n\n",
    "data: {\"error\":{\"code\":429,\"message\":\"You have exhausted your capacity on this model.\"}}\n\n",
);

#[tokio::test]
async fn streaming_mid_failure_emits_error_event_and_never_retries() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_handler = hits.clone();
    let upstream = Router::new().route(
        "/v1internal:streamGenerateContent",
        post(move || {
            hits_handler.fetch_add(1, Ordering::SeqCst);
            async move {
                ([("content-type", "text/event-stream")], MID_FAILURE_SSE).into_response()
            }
        }),
    );
    let harness = spawn_harness(upstream, |_| {}).await;
    let a = add_ready_account(&harness.store, "a@test", "proj-a", "free-tier");
    let b = add_ready_account(&harness.store, "b@test", "proj-b", "free-tier");
    harness.store.touch_last_used(a, 1).unwrap();
    harness.store.touch_last_used(b, 2).unwrap();
    harness.pool.load_from_store().unwrap();

    let response = harness.post_stream_generate("m", &native_body()).await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let text = response.text().await.unwrap();

    // Both delivered chunks precede the terminal error event.
    let first = text.find("\"text\":\"a\"").expect("first chunk");
    let second = text.find("\"text\":\"b\"").expect("second chunk");
    let error = text.find("\"code\":\"rate_limit_exceeded\"").expect("error event");
    assert!(first < second && second < error);
    assert!(!text.contains("[DONE]"));

    // One upstream attempt only; the offending pair cooled down.
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(harness.pool.cooldown_until(a, "m").is_some());

    let logs = harness.store.recent_request_logs(10).unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, "error");
    assert_eq!(logs[0].account_id, Some(a));
    assert_eq!(logs[0].usage.total_tokens, 7);
    assert_eq!(harness.limiter.in_flight("m"), 0);
    assert_eq!(harness.pool.locked_count(), 0);
}

#[tokio::test]
async fn streaming_capacity_before_first_event_retries_on_next_account() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_handler = hits.clone();
    let upstream = Router::new().route(
        "/v1internal:streamGenerateContent",
        post(move |Json(envelope): Json<Value>| {
            hits_handler.fetch_add(1, Ordering::SeqCst);
            async move {
                let project = envelope["project"].as_str().unwrap_or_default().to_string();
                if project == "proj-a" {
                    (
                        axum::http::StatusCode::TOO_MANY_REQUESTS,
                        "No capacity available",
                    )
                        .into_response()
                } else {
                    (
                        [("content-type", "text/event-stream")],
                        "data: {\"response\":{\"candidates\":[{\"index\":0}]}}\n\n",
                    )
                        .into_response()
                }
            }
        }),
    );
    let harness = spawn_harness(upstream, |_| {}).await;
    let a = add_ready_account(&harness.store, "a@test", "proj-a", "free-tier");
    let b = add_ready_account(&harness.store, "b@test", "proj-b", "free-tier");
    harness.store.touch_last_used(a, 1).unwrap();
    harness.store.touch_last_used(b, 2).unwrap();
    harness.pool.load_from_store().unwrap();

    let response = harness.post_stream_generate("m", &native_body()).await;
    let text = response.text().await.unwrap();

    assert!(text.contains("\"index\":0"));
    assert!(!text.contains("rate_limit_exceeded"));
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let logs = harness.store.recent_request_logs(10).unwrap();
    assert_eq!(logs[0].status, "success");
    assert_eq!(logs[0].account_id, Some(b));
    assert_eq!(logs[0].attempt_no, 2);
}

#[tokio::test]
async fn empty_upstream_stream_surfaces_typed_error_event() {
    let upstream = Router::new().route(
        "/v1internal:streamGenerateContent",
        post(|| async { ([("content-type", "text/event-stream")], "").into_response() }),
    );
    let harness = spawn_harness(upstream, |_| {}).await;
    add_ready_account(&harness.store, "a@test", "proj-a", "free-tier");
    harness.pool.load_from_store().unwrap();

    let response = harness.post_stream_generate("m", &native_body()).await;
    let text = response.text().await.unwrap();
    assert!(text.contains("\"code\":\"empty_upstream_response\""));

    let logs = harness.store.recent_request_logs(10).unwrap();
    assert_eq!(logs[0].status, "error");
    assert_eq!(
        logs[0].error_message.as_deref(),
        Some("empty upstream response")
    );
}

#[tokio::test]
async fn chat_dialect_streams_with_done_terminator_and_alias() {
    let upstream = Router::new().route(
        "/v1internal:streamGenerateContent",
        post(|Json(envelope): Json<Value>| async move {
            assert_eq!(envelope["model"], "gemini-3-pro");
            (
                [("content-type", "text/event-stream")],
                "data: {\"response\":{\"candidates\":[{\"index\":0}]}}\n\n",
            )
                .into_response()
        }),
    );
    let harness = spawn_harness(upstream, |config| {
        config
            .model_aliases
            .insert("gemini-pro-latest".to_string(), "gemini-3-pro".to_string());
    })
    .await;
    add_ready_account(&harness.store, "a@test", "proj-a", "free-tier");
    harness.pool.load_from_store().unwrap();

    let body = json!({
        "model": "gemini-pro-latest",
        "stream": true,
        "contents": [{"role": "user", "parts": [{"text": "hi"}]}]
    });
    let response = harness
        .client
        .post(format!("{}/v1/chat/completions", harness.base_url))
        .bearer_auth(&harness.api_key)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let text = response.text().await.unwrap();

    let chunk = text.find("\"index\":0").expect("chunk");
    let done = text.find("data: [DONE]").expect("done frame");
    assert!(chunk < done);

    let logs = harness.store.recent_request_logs(10).unwrap();
    assert_eq!(logs[0].model, "gemini-3-pro");
}

#[tokio::test]
async fn chat_dialect_without_converter_rejects_foreign_bodies() {
    let (upstream, hits) = project_keyed_upstream(HashMap::new());
    let harness = spawn_harness(upstream, |_| {}).await;
    add_ready_account(&harness.store, "a@test", "proj-a", "free-tier");
    harness.pool.load_from_store().unwrap();

    let body = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});
    let response = harness
        .client
        .post(format!("{}/v1/chat/completions", harness.base_url))
        .bearer_auth(&harness.api_key)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_api_key_is_rejected_before_dispatch() {
    let (upstream, hits) = project_keyed_upstream(HashMap::new());
    let harness = spawn_harness(upstream, |_| {}).await;
    add_ready_account(&harness.store, "a@test", "proj-a", "free-tier");
    harness.pool.load_from_store().unwrap();

    let response = harness
        .client
        .post(format!(
            "{}/v1beta/models/m:generateContent",
            harness.base_url
        ))
        .bearer_auth("sk-wrong")
        .json(&native_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(harness.store.recent_request_logs(10).unwrap().is_empty());
}

#[tokio::test]
async fn client_disconnect_releases_slot_and_logs_error() {
    // Upstream emits one chunk then stalls forever.
    let upstream = Router::new().route(
        "/v1internal:streamGenerateContent",
        post(|| async {
            let stream = async_stream::stream! {
                yield Ok::<_, std::io::Error>(bytes::Bytes::from_static(
                    b"data: {\"response\":{\"candidates\":[{\"index\":0}]}}\n\n",
                ));
                futures::future::pending::<()>().await;
            };
            (
                [("content-type", "text/event-stream")],
                axum::body::Body::from_stream(stream),
            )
                .into_response()
        }),
    );
    let harness = spawn_harness(upstream, |_| {}).await;
    let a = add_ready_account(&harness.store, "a@test", "proj-a", "free-tier");
    harness.pool.load_from_store().unwrap();

    let response = harness.post_stream_generate("m", &native_body()).await;
    assert_eq!(response.status(), 200);
    // Observe the first chunk, then hang up.
    drop(response);

    // Release is driven by the dropped body; poll until it lands.
    let mut released = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if harness.limiter.in_flight("m") == 0 && !harness.pool.is_locked(a) {
            released = true;
            break;
        }
    }
    assert!(released, "slot and lock must be released after disconnect");

    let mut logged = false;
    for _ in 0..40 {
        let logs = harness.store.recent_request_logs(10).unwrap();
        if let Some(log) = logs.first() {
            assert_eq!(log.status, "error");
            assert_eq!(log.error_message.as_deref(), Some("client disconnected"));
            logged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(logged, "disconnect must be logged");
}

#[tokio::test]
async fn image_model_switches_request_type() {
    let seen_type = Arc::new(std::sync::Mutex::new(String::new()));
    let seen_handler = seen_type.clone();
    let upstream = Router::new().route(
        "/v1internal:generateContent",
        post(move |Json(envelope): Json<Value>| {
            let seen = seen_handler.clone();
            async move {
                *seen.lock().unwrap() = envelope["requestType"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                Json(json!({"response": {"candidates": []}}))
            }
        }),
    );
    let harness = spawn_harness(upstream, |_| {}).await;
    add_ready_account(&harness.store, "a@test", "proj-a", "free-tier");
    harness.pool.load_from_store().unwrap();

    let response = harness
        .post_generate("gemini-3-pro-image", &native_body())
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(*seen_type.lock().unwrap(), "image_gen");
}
