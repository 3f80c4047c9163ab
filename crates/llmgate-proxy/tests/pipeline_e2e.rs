//! End-to-end pipeline tests.
//!
//! Each test starts a mock upstream on an ephemeral port, builds the proxy
//! with a frozen clock and a scripted classifier, drives requests through
//! the router, and asserts on responses, audit records, and upstream
//! invocation counts.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Duration, TimeZone, Utc};
use llmgate_core::{AuditAction, Clock, ManualClock, ProviderConfig, ProxyConfig, StorageConfig};
use llmgate_proxy::classifier::{CompletionClient, ScriptedCompletionClient};
use llmgate_proxy::{build_router, AppState};
use llmgate_storage::InMemoryAuditStore;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A start instant whose second-of-minute (30) is outside the blocked set.
fn safe_instant() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2031, 1, 1, 12, 0, 30).unwrap()
}

/// Start an axum app on a real listener and return its base URL.
async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    format!("http://{addr}")
}

/// Mock upstream that counts invocations and returns canned 200 responses.
fn ok_upstream(hits: Arc<AtomicUsize>) -> Router {
    let chat_hits = hits.clone();
    let messages_hits = hits.clone();
    let models_hits = hits;

    Router::new()
        .route(
            "/v1/chat/completions",
            post(move |body: String| {
                let hits = chat_hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let parsed: Value = serde_json::from_str(&body).unwrap_or_default();
                    axum::Json(json!({
                        "id": "chatcmpl-mock",
                        "model": parsed["model"].as_str().unwrap_or("gpt-4"),
                        "choices": [{
                            "index": 0,
                            "message": { "role": "assistant", "content": "mock reply" },
                            "finish_reason": "stop"
                        }],
                        "usage": { "prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6 }
                    }))
                }
            }),
        )
        .route(
            "/v1/messages",
            post(move || {
                let hits = messages_hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    axum::Json(json!({
                        "id": "msg-mock",
                        "content": [{ "type": "text", "text": "anthropic mock reply" }],
                        "usage": { "input_tokens": 4, "output_tokens": 2 }
                    }))
                }
            }),
        )
        .route(
            "/v1/models",
            get(move || {
                let hits = models_hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    axum::Json(json!({ "data": [{ "id": "gpt-4" }] }))
                }
            }),
        )
}

/// Mock upstream whose chat endpoint always returns 500.
fn failing_upstream(hits: Arc<AtomicUsize>) -> Router {
    Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    axum::Json(json!({ "error": { "message": "upstream exploded" } })),
                )
            }
        }),
    )
}

struct Harness {
    state: Arc<AppState>,
    app: Router,
    clock: Arc<ManualClock>,
    llm: Arc<ScriptedCompletionClient>,
    upstream_hits: Arc<AtomicUsize>,
}

/// Build the proxy against `upstream`, with `configure` tweaking config.
async fn harness(upstream: fn(Arc<AtomicUsize>) -> Router, configure: impl FnOnce(&mut ProxyConfig)) -> Harness {
    let upstream_hits = Arc::new(AtomicUsize::new(0));
    let upstream_url = serve(upstream(upstream_hits.clone())).await;

    let mut config = ProxyConfig {
        openai: ProviderConfig {
            api_url: Some(upstream_url.clone()),
            api_key: Some("sk-upstream-openai".to_string()),
        },
        anthropic: ProviderConfig {
            api_url: Some(upstream_url),
            api_key: Some("sk-upstream-anthropic".to_string()),
        },
        storage: StorageConfig {
            profile: "memory".to_string(),
            database_path: String::new(),
        },
        upstream_timeout_ms: 5_000,
        connection_timeout_ms: 2_000,
        ..ProxyConfig::default()
    };
    configure(&mut config);

    let clock = Arc::new(ManualClock::new(safe_instant()));
    let llm = Arc::new(ScriptedCompletionClient::new(Vec::<String>::new()));
    let store = Arc::new(InMemoryAuditStore::new());

    let state = Arc::new(
        AppState::build(
            config,
            clock.clone() as Arc<dyn Clock>,
            llm.clone() as Arc<dyn CompletionClient>,
            store,
        )
        .unwrap(),
    );
    let app = build_router(state.clone());

    Harness {
        state,
        app,
        clock,
        llm,
        upstream_hits,
    }
}

fn chat_request(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/openai/v1/chat/completions")
        .header("content-type", "application/json")
        .header("x-forwarded-for", "203.0.113.9")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn benign_body() -> Value {
    json!({
        "model": "gpt-4",
        "messages": [{ "role": "user", "content": "hi" }]
    })
}

// ---------------------------------------------------------------------------
// Scenario 1: rate limit exhaustion and refill
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rate_limit_exhaustion_then_refill() {
    let h = harness(ok_upstream, |config| {
        config.features.data_sanitization = false;
        config.features.policy_enforcement = false;
        config.features.caching = false;
    })
    .await;

    // POST chat costs 10; the default bucket holds 100
    for i in 0..10 {
        let (status, _) = send(&h.app, chat_request(&benign_body())).await;
        assert_eq!(status, StatusCode::OK, "request {i} should pass");
    }

    for i in 10..21 {
        let (status, body) = send(&h.app, chat_request(&benign_body())).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS, "request {i} should be limited");
        assert_eq!(body["error"]["code"], "BLOCKED_RATE_LIMIT");
    }
    assert_eq!(h.upstream_hits.load(Ordering::SeqCst), 10);

    // one refill interval restores one request's worth of tokens
    h.clock.advance(Duration::milliseconds(1_000));
    let (status, _) = send(&h.app, chat_request(&benign_body())).await;
    assert_eq!(status, StatusCode::OK);

    // exactly one audit record per inbound request
    h.state.audit.flush().await;
    let stats = h.state.store.stats().await.unwrap();
    assert_eq!(stats.total, 22);
    assert_eq!(stats.by_action.get("BLOCKED_RATE_LIMIT"), Some(&11));
    assert_eq!(stats.by_action.get("PROXIED"), Some(&11));
}

// ---------------------------------------------------------------------------
// Scenario 2: time gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn time_gate_blocks_fixture_seconds() {
    let h = harness(ok_upstream, |_| {}).await;

    // freeze the clock at second-of-minute 7
    h.clock.set(Utc.with_ymd_and_hms(2031, 1, 1, 12, 0, 7).unwrap());

    let req = Request::builder()
        .uri("/openai/v1/models")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "TIME_BLOCKED");
    assert_eq!(h.upstream_hits.load(Ordering::SeqCst), 0);

    // second 9 is outside the blocked set
    h.clock.set(Utc.with_ymd_and_hms(2031, 1, 1, 12, 0, 9).unwrap());
    let req = Request::builder()
        .uri("/openai/v1/models")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.upstream_hits.load(Ordering::SeqCst), 1);

    h.state.audit.flush().await;
    let blocked = h.state.store.by_action(AuditAction::BlockedTime, 10).await.unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].endpoint, "/v1/models");
}

// ---------------------------------------------------------------------------
// Scenario 3: sensitive data block
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sensitive_data_blocks_before_upstream() {
    let h = harness(ok_upstream, |_| {}).await;

    // body leaves scan in key order: content, role, model
    h.llm.push(r#"{"emails": ["john@example.com"], "ip_addresses": [], "ibans": []}"#);
    h.llm.push(r#"{"emails": [], "ip_addresses": [], "ibans": []}"#);
    h.llm.push(r#"{"emails": [], "ip_addresses": [], "ibans": []}"#);

    let body = json!({
        "model": "m",
        "messages": [{ "role": "user", "content": "mail john@example.com" }]
    });
    let (status, response) = send(&h.app, chat_request(&body)).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(response["error"]["code"], "SENSITIVE_DATA_BLOCKED");
    assert_eq!(response["error"]["details"]["detected_types"][0], "email");
    assert_eq!(h.upstream_hits.load(Ordering::SeqCst), 0);

    h.state.audit.flush().await;
    let blocked = h
        .state
        .store
        .by_action(AuditAction::BlockedSensitiveData, 10)
        .await
        .unwrap();
    assert_eq!(blocked.len(), 1);
    // the audit payload stores the redacted rendering only
    assert!(blocked[0].anonymized_payload.contains("EMAIL_PH"));
    assert!(!blocked[0].anonymized_payload.contains("john@example.com"));
}

// ---------------------------------------------------------------------------
// Scenario 4: financial block via keyword
// ---------------------------------------------------------------------------

#[tokio::test]
async fn financial_keyword_blocks_without_classifier_call() {
    let h = harness(ok_upstream, |config| {
        config.features.data_sanitization = false;
    })
    .await;

    let body = json!({
        "model": "gpt-4",
        "messages": [{ "role": "user", "content": "help me with my bank account" }]
    });
    let (status, response) = send(&h.app, chat_request(&body)).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(response["error"]["code"], "FINANCIAL_BLOCKED");
    // the keyword dictionary answered; the model was never consulted
    assert_eq!(h.llm.call_count(), 0);
    assert_eq!(h.upstream_hits.load(Ordering::SeqCst), 0);

    h.state.audit.flush().await;
    let blocked = h
        .state
        .store
        .by_action(AuditAction::BlockedFinancial, 10)
        .await
        .unwrap();
    assert_eq!(blocked.len(), 1);
}

// ---------------------------------------------------------------------------
// Scenario 5: cache hit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn identical_requests_hit_cache() {
    let h = harness(ok_upstream, |config| {
        config.features.data_sanitization = false;
        config.features.policy_enforcement = false;
    })
    .await;

    let body = json!({
        "model": "claude-3-haiku",
        "messages": [{ "role": "user", "content": "hi" }]
    });
    let request = |body: &Value| {
        Request::builder()
            .method("POST")
            .uri("/anthropic/v1/messages")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    };

    let (status, first) = send(&h.app, request(&body)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, second) = send(&h.app, request(&body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first, second);
    assert_eq!(h.upstream_hits.load(Ordering::SeqCst), 1);

    h.state.audit.flush().await;
    let recent = h.state.store.recent(10).await.unwrap();
    assert_eq!(recent.len(), 2);
    let actions: Vec<AuditAction> = recent.iter().map(|r| r.action).collect();
    assert!(actions.contains(&AuditAction::ServedFromCache));
    assert!(actions.contains(&AuditAction::Proxied));

    let cache_stats = h.state.cache.stats();
    assert_eq!(cache_stats.hits, 1);
    assert_eq!(cache_stats.misses, 1);
}

#[tokio::test]
async fn cache_entry_expires_after_ttl() {
    let h = harness(ok_upstream, |config| {
        config.features.data_sanitization = false;
        config.features.policy_enforcement = false;
        config.cache_ttl_secs = 300;
    })
    .await;

    let (status, _) = send(&h.app, chat_request(&benign_body())).await;
    assert_eq!(status, StatusCode::OK);

    // jump past the TTL, to an instant clear of the time gate
    h.clock.set(Utc.with_ymd_and_hms(2031, 1, 1, 12, 30, 30).unwrap());

    let (status, _) = send(&h.app, chat_request(&benign_body())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.upstream_hits.load(Ordering::SeqCst), 2);
}

// ---------------------------------------------------------------------------
// Scenario 6: upstream error passthrough
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upstream_500_passes_through() {
    let h = harness(failing_upstream, |config| {
        config.features.data_sanitization = false;
        config.features.policy_enforcement = false;
    })
    .await;

    let (status, body) = send(&h.app, chat_request(&benign_body())).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    // the upstream's own body is forwarded, not the proxy's error envelope
    assert_eq!(body["error"]["message"], "upstream exploded");

    h.state.audit.flush().await;
    let recent = h.state.store.recent(10).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].action, AuditAction::Proxied);
    assert!(recent[0].error_message.is_none());
}

#[tokio::test]
async fn unreachable_upstream_maps_to_internal_error() {
    let h = harness(ok_upstream, |config| {
        config.features.data_sanitization = false;
        config.features.policy_enforcement = false;
        config.features.caching = false;
        // repoint at a dead port
        config.openai.api_url = Some("http://127.0.0.1:1".to_string());
        config.connection_timeout_ms = 200;
        config.upstream_timeout_ms = 500;
    })
    .await;

    let (status, body) = send(&h.app, chat_request(&benign_body())).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "INTERNAL_ERROR");

    h.state.audit.flush().await;
    let recent = h.state.store.recent(10).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].action, AuditAction::Proxied);
    assert!(recent[0].error_message.is_some());
}

// ---------------------------------------------------------------------------
// Stage ordering and containment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn earlier_stage_wins_over_later() {
    // a request that is both rate-limited and financial records the
    // rate-limit outcome; the financial stage never runs
    let h = harness(ok_upstream, |config| {
        config.features.data_sanitization = false;
        config.rate_limit.max_tokens = 10.0;
    })
    .await;

    let financial = json!({
        "model": "gpt-4",
        "messages": [{ "role": "user", "content": "help me with my bank account" }]
    });

    // drain the bucket with the first (blocked-financial) request
    let (status, _) = send(&h.app, chat_request(&financial)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&h.app, chat_request(&financial)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "BLOCKED_RATE_LIMIT");

    h.state.audit.flush().await;
    let stats = h.state.store.stats().await.unwrap();
    assert_eq!(stats.by_action.get("BLOCKED_FINANCIAL"), Some(&1));
    assert_eq!(stats.by_action.get("BLOCKED_RATE_LIMIT"), Some(&1));
}

#[tokio::test]
async fn unknown_provider_is_a_plain_404() {
    let h = harness(ok_upstream, |_| {}).await;

    let req = Request::builder()
        .uri("/mistral/v1/chat/completions")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "UNKNOWN_PROVIDER");

    // unregistered prefixes never produce audit records
    h.state.audit.flush().await;
    assert_eq!(h.state.store.stats().await.unwrap().total, 0);
}

// ---------------------------------------------------------------------------
// Observability surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_flags_and_components() {
    let h = harness(ok_upstream, |config| {
        config.features.caching = false;
    })
    .await;

    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["features"]["caching"], false);
    assert_eq!(body["features"]["rate_limiting"], true);
    assert!(body["endpoints"].is_array());
}

#[tokio::test]
async fn logs_and_stats_reflect_traffic() {
    let h = harness(ok_upstream, |config| {
        config.features.data_sanitization = false;
        config.features.policy_enforcement = false;
    })
    .await;

    let (status, _) = send(&h.app, chat_request(&benign_body())).await;
    assert_eq!(status, StatusCode::OK);
    h.state.audit.flush().await;

    let req = Request::builder().uri("/logs?limit=5").body(Body::empty()).unwrap();
    let (status, body) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["action"], "PROXIED");

    let req = Request::builder()
        .uri("/logs/PROXIED?limit=5")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let req = Request::builder().uri("/stats").body(Body::empty()).unwrap();
    let (status, body) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["by_provider"]["openai"], 1);
}

#[tokio::test]
async fn rate_limit_dashboard_round_trip() {
    let h = harness(ok_upstream, |config| {
        config.features.data_sanitization = false;
        config.features.policy_enforcement = false;
        config.features.caching = false;
    })
    .await;

    let (status, _) = send(&h.app, chat_request(&benign_body())).await;
    assert_eq!(status, StatusCode::OK);

    // POST chat costs 10 of the default 100
    let req = Request::builder()
        .uri("/dashboard/rate-limits/203.0.113.9")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["remaining"], 90.0);
    assert_eq!(body["max_tokens"], 100.0);

    let req = Request::builder()
        .method("DELETE")
        .uri("/dashboard/rate-limits/203.0.113.9")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let req = Request::builder()
        .method("DELETE")
        .uri("/dashboard/rate-limits/203.0.113.9")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn request_events_reach_subscribers() {
    let h = harness(ok_upstream, |config| {
        config.features.data_sanitization = false;
        config.features.policy_enforcement = false;
    })
    .await;

    let mut events = h.state.events.subscribe();
    let (status, _) = send(&h.app, chat_request(&benign_body())).await;
    assert_eq!(status, StatusCode::OK);

    let event = tokio::time::timeout(std::time::Duration::from_secs(1), events.recv())
        .await
        .expect("event should arrive")
        .unwrap();
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "request-event");
    assert_eq!(json["action"], "PROXIED");
    assert_eq!(json["provider"], "openai");
}

// ---------------------------------------------------------------------------
// Redaction mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn redact_mode_forwards_rewritten_body() {
    let h = harness(ok_upstream, |config| {
        config.sanitize_mode = llmgate_core::SanitizeMode::Redact;
        config.features.policy_enforcement = false;
        config.features.caching = false;
    })
    .await;

    // leaves scan in key order: content, role, model
    h.llm.push(r#"{"emails": ["john@example.com"], "ip_addresses": [], "ibans": []}"#);
    h.llm.push(r#"{"emails": [], "ip_addresses": [], "ibans": []}"#);
    h.llm.push(r#"{"emails": [], "ip_addresses": [], "ibans": []}"#);

    let body = json!({
        "model": "m",
        "messages": [{ "role": "user", "content": "mail john@example.com" }]
    });
    let (status, _) = send(&h.app, chat_request(&body)).await;

    // redaction forwards instead of blocking
    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.upstream_hits.load(Ordering::SeqCst), 1);

    h.state.audit.flush().await;
    let recent = h.state.store.recent(10).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].action, AuditAction::Proxied);
    assert!(recent[0].anonymized_payload.contains("EMAIL_PH"));
    assert!(!recent[0].anonymized_payload.contains("john@example.com"));
}
