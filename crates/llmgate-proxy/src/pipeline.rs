//! Per-request interception pipeline.
//!
//! Runs the security stages in fixed order: rate limit, time gate,
//! sanitisation, policy classification, cache lookup, upstream dispatch,
//! cache insertion. A stage either passes or short-circuits with a terminal
//! action; every path through the handler emits exactly one audit record
//! and one request event. Short circuits are ordinary outcomes, not errors;
//! only upstream transport faults map to 500.

use crate::audit::AuditLogger;
use crate::cache::{self, CachedResponse, ResponseCache};
use crate::classifier::CompletionClient;
use crate::error::{error_response, ErrorCode};
use crate::events::{EventBus, RequestEvent};
use crate::policy::PolicyClassifier;
use crate::rate_limit::RateLimiter;
use crate::router::split_provider;
use crate::sanitize::{
    RedactAndForward, RejectOnDetect, SanitizeOutcome, SanitizeStrategy, SensitiveDataDetector,
};
use crate::upstream::UpstreamClient;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response};
use bytes::Bytes;
use chrono::{DateTime, Timelike, Utc};
use llmgate_core::{
    AuditAction, AuditRecord, AuditStore, Clock, GateError, Provider, ProxyConfig, Result,
    SanitizeMode,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Seconds-of-minute during which the time gate rejects requests.
const BLOCKED_SECONDS: [u32; 4] = [1, 2, 7, 8];

/// Endpoint suffixes that get sanitisation, policy, and caching.
const GUARDED_SUFFIXES: [&str; 2] = ["/chat/completions", "/messages"];

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Shared state threaded through axum handlers via [`State`].
pub struct AppState {
    pub config: ProxyConfig,
    pub clock: Arc<dyn Clock>,
    pub limiter: RateLimiter,
    pub cache: ResponseCache,
    pub sanitizer: Arc<dyn SanitizeStrategy>,
    pub policy: PolicyClassifier,
    pub upstream: UpstreamClient,
    pub audit: AuditLogger,
    pub store: Arc<dyn AuditStore>,
    pub events: EventBus,
    /// Whether the external classifier has a usable credential.
    pub classifier_configured: bool,
}

impl AppState {
    /// Wire up all pipeline collaborators.
    ///
    /// The clock and the completion client are injected so tests can freeze
    /// time and script classifier verdicts.
    pub fn build(
        config: ProxyConfig,
        clock: Arc<dyn Clock>,
        llm: Arc<dyn CompletionClient>,
        store: Arc<dyn AuditStore>,
    ) -> Result<Self> {
        let limiter = RateLimiter::new(config.rate_limit.clone(), clock.clone());
        let cache = ResponseCache::new(config.cache_ttl_secs, clock.clone());
        let upstream = UpstreamClient::new(
            config.bindings(),
            config.upstream_timeout_ms,
            config.connection_timeout_ms,
        )
        .map_err(|e| GateError::Config(e.to_string()))?;

        let detector = SensitiveDataDetector::new(llm.clone())?;
        let sanitizer: Arc<dyn SanitizeStrategy> = match config.sanitize_mode {
            SanitizeMode::Reject => Arc::new(RejectOnDetect::new(detector)),
            SanitizeMode::Redact => Arc::new(RedactAndForward::new(detector)),
        };
        let policy = PolicyClassifier::new(llm.clone(), config.financial_detection_strict);
        let audit = AuditLogger::spawn(store.clone());
        let classifier_configured = llm.is_configured();

        Ok(Self {
            config,
            clock,
            limiter,
            cache,
            sanitizer,
            policy,
            upstream,
            audit,
            store,
            events: EventBus::new(),
            classifier_configured,
        })
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

/// Identity used to key the rate limiter: first forwarded-for hop, then
/// the real-IP header, then the peer address.
pub fn client_identity(headers: &HeaderMap, peer: Option<&str>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    peer.unwrap_or("unknown").to_string()
}

/// Whether this upstream path gets the content stages (sanitisation,
/// policy, caching).
pub fn is_guarded_endpoint(path: &str) -> bool {
    GUARDED_SUFFIXES.iter().any(|suffix| path.ends_with(suffix))
}

/// Token cost of a request: base 1, chat/messages endpoints 5, POST doubles.
pub fn request_cost(path: &str, method: &Method) -> f64 {
    let mut cost = if is_guarded_endpoint(path) { 5.0 } else { 1.0 };
    if *method == Method::POST {
        cost *= 2.0;
    }
    cost
}

/// Canonical text a body is classified on: concatenated message contents,
/// else the prompt, else the input, else the serialised body.
pub fn extract_policy_text(body: &Value) -> String {
    if let Some(messages) = body["messages"].as_array() {
        let parts: Vec<String> = messages
            .iter()
            .map(|m| match &m["content"] {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            })
            .collect();
        return parts.join("\n");
    }
    if let Some(prompt) = body["prompt"].as_str() {
        return prompt.to_string();
    }
    if let Some(input) = body["input"].as_str() {
        return input.to_string();
    }
    body.to_string()
}

/// The payload text stored on the audit record.
fn render_payload(body: Option<&Value>, raw: &Bytes) -> String {
    match body {
        Some(value) => value.to_string(),
        None => String::from_utf8_lossy(raw).into_owned(),
    }
}

// ---------------------------------------------------------------------------
// Main handler
// ---------------------------------------------------------------------------

struct RequestScope<'a> {
    state: &'a AppState,
    provider: Provider,
    upstream_path: String,
    full_path: String,
    method: Method,
    received_at: DateTime<Utc>,
    started: std::time::Instant,
}

impl RequestScope<'_> {
    /// Emit the one audit record and request event for this request.
    fn finalize(
        &self,
        action: AuditAction,
        payload: String,
        response_time_ms: Option<i64>,
        error_message: Option<String>,
    ) {
        let mut record = AuditRecord::new(
            self.received_at,
            self.provider,
            self.upstream_path.clone(),
            action,
            payload,
        );
        if let Some(ms) = response_time_ms {
            record = record.with_response_time(ms);
        }
        if let Some(message) = error_message {
            record = record.with_error(message);
        }
        self.state.audit.log(record);

        self.state.events.publish_request(RequestEvent {
            provider: self.provider,
            action,
            path: self.upstream_path.clone(),
            at: self.received_at,
        });
    }

    fn reject(
        &self,
        action: AuditAction,
        code: ErrorCode,
        message: &str,
        payload: String,
        details: Option<Value>,
    ) -> Response<Body> {
        debug!(
            provider = %self.provider,
            path = %self.upstream_path,
            action = %action,
            "Request blocked"
        );
        self.finalize(action, payload, None, None);
        error_response(
            code,
            message,
            &self.full_path,
            self.method.as_str(),
            self.received_at,
            details,
        )
    }

    fn elapsed_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }
}

/// Axum fallback handler: the full interception pipeline for one request.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Response<Body> {
    let received_at = state.clock.now();
    let started = std::time::Instant::now();

    let method = req.method().clone();
    let uri = req.uri().clone();
    let full_path = uri.path().to_string();
    let query = uri.query().map(|q| q.to_string());
    let headers = req.headers().clone();
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string());
    let identity = client_identity(&headers, peer.as_deref());

    // Unknown prefixes never enter the pipeline.
    let Some((provider, upstream_path)) = split_provider(&full_path) else {
        return error_response(
            ErrorCode::UnknownProvider,
            "Unknown provider namespace",
            &full_path,
            method.as_str(),
            received_at,
            None,
        );
    };

    let scope = RequestScope {
        state: &state,
        provider,
        upstream_path,
        full_path,
        method: method.clone(),
        received_at,
        started,
    };

    let body_bytes = match axum::body::to_bytes(
        req.into_body(),
        state.config.max_request_size_bytes as usize,
    )
    .await
    {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to read request body: {e}");
            scope.finalize(
                AuditAction::Proxied,
                String::new(),
                None,
                Some(format!("failed to read request body: {e}")),
            );
            return error_response(
                ErrorCode::InternalError,
                "Failed to read request body",
                &scope.full_path,
                method.as_str(),
                received_at,
                None,
            );
        }
    };

    let mut body_parsed: Option<Value> = if body_bytes.is_empty() {
        None
    } else {
        serde_json::from_slice(&body_bytes).ok()
    };

    // --- Stage 1: rate limit ---
    if state.config.features.rate_limiting {
        let cost = request_cost(&scope.upstream_path, &method);
        if !state.limiter.try_consume(&identity, cost) {
            return scope.reject(
                AuditAction::BlockedRateLimit,
                ErrorCode::BlockedRateLimit,
                "Rate limit exceeded, please slow down",
                render_payload(body_parsed.as_ref(), &body_bytes),
                None,
            );
        }
    }

    // --- Stage 2: time gate ---
    if state.config.features.time_based_blocking {
        let second = state.clock.now().second();
        if BLOCKED_SECONDS.contains(&second) {
            return scope.reject(
                AuditAction::BlockedTime,
                ErrorCode::TimeBlocked,
                "Requests are blocked during this time window",
                render_payload(body_parsed.as_ref(), &body_bytes),
                None,
            );
        }
    }

    let guarded = is_guarded_endpoint(&scope.upstream_path);

    // --- Stage 3: sanitisation ---
    if guarded && state.config.features.data_sanitization {
        let outcome = match &body_parsed {
            Some(body) => state.sanitizer.apply(body).await,
            None => SanitizeOutcome::Clean,
        };
        match outcome {
            SanitizeOutcome::Clean => {}
            SanitizeOutcome::Rejected {
                detected,
                redacted_body,
            } => {
                let types: Vec<&str> = detected.iter().map(|c| c.as_str()).collect();
                return scope.reject(
                    AuditAction::BlockedSensitiveData,
                    ErrorCode::SensitiveDataBlocked,
                    "Sensitive data detected in request",
                    redacted_body.to_string(),
                    Some(json!({ "detected_types": types })),
                );
            }
            SanitizeOutcome::Redacted { body } => {
                debug!(path = %scope.upstream_path, "Forwarding redacted body");
                body_parsed = Some(body);
            }
        }
    }

    let audit_payload = render_payload(body_parsed.as_ref(), &body_bytes);

    // --- Stage 4: policy classification ---
    if guarded && state.config.features.policy_enforcement {
        if let Some(body) = &body_parsed {
            let text = extract_policy_text(body);
            if (10..=2000).contains(&text.chars().count())
                && state.policy.is_financial(&text).await
            {
                return scope.reject(
                    AuditAction::BlockedFinancial,
                    ErrorCode::FinancialBlocked,
                    "Financial content is not allowed",
                    audit_payload,
                    None,
                );
            }
        }
    }

    // --- Stage 5: cache lookup ---
    let fingerprint = if guarded && state.config.features.caching {
        Some(ResponseCache::fingerprint(
            provider,
            &scope.upstream_path,
            body_parsed.as_ref().unwrap_or(&Value::Null),
        ))
    } else {
        None
    };

    if let Some(fp) = &fingerprint {
        if let Some(entry) = state.cache.get(fp) {
            debug!(path = %scope.upstream_path, "Serving from cache");
            scope.finalize(
                AuditAction::ServedFromCache,
                audit_payload,
                Some(scope.elapsed_ms()),
                None,
            );
            return cached_reply(&entry);
        }
    }

    // --- Stage 6: upstream dispatch ---
    let upstream_response = match state
        .upstream
        .send(
            provider,
            &method,
            &scope.upstream_path,
            query.as_deref(),
            &headers,
            body_parsed.as_ref(),
        )
        .await
    {
        Ok(response) => response,
        Err(e) => {
            error!(provider = %provider, "Upstream request failed: {e}");
            scope.finalize(AuditAction::Proxied, audit_payload, None, Some(e.to_string()));
            return error_response(
                ErrorCode::InternalError,
                "Upstream request failed",
                &scope.full_path,
                method.as_str(),
                received_at,
                None,
            );
        }
    };

    // --- Stage 7: cache insertion ---
    if let Some(fp) = fingerprint {
        if upstream_response.status == 200 {
            state.cache.put(
                fp,
                upstream_response.status,
                &upstream_response.headers,
                upstream_response.body.clone(),
            );
        }
    }

    // --- Stage 8: respond and log ---
    scope.finalize(
        AuditAction::Proxied,
        audit_payload,
        Some(scope.elapsed_ms()),
        None,
    );

    let mut builder = Response::builder().status(upstream_response.status);
    for (name, value) in cache::filter_headers(&upstream_response.headers) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from(upstream_response.body))
        .unwrap_or_else(|e| {
            error!("Failed to assemble response: {e}");
            error_response(
                ErrorCode::InternalError,
                "Failed to assemble response",
                &scope.full_path,
                scope.method.as_str(),
                received_at,
                None,
            )
        })
}

/// Replay a cached entry. Its headers were already filtered on insertion.
fn cached_reply(entry: &CachedResponse) -> Response<Body> {
    let mut builder = Response::builder().status(entry.status);
    for (name, value) in &entry.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from(entry.body.clone()))
        .expect("cached response must build")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
