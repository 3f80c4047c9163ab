//! Outbound dispatch to the provider upstreams.
//!
//! Builds the forwarded request from a whitelist copy of the inbound
//! headers, substitutes the provider credential for whatever the client
//! sent, and buffers the response to completion. Transport failures
//! (connect, DNS, timeout) are faults; upstream HTTP error statuses are
//! ordinary responses and pass through untouched.

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use llmgate_core::{AuthStyle, Provider, ProviderBinding};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Inbound headers copied through to the upstream. Everything else is
/// dropped, including framing, connection, and the client's own
/// authorization.
const FORWARDED_HEADERS: &[&str] = &["content-type", "user-agent", "accept", "cache-control", "pragma"];

/// Protocol-version header sent alongside `x-api-key` credentials.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// A buffered upstream response.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Parsed body, when it was valid JSON.
    pub body_json: Option<Value>,
}

/// Transport-level dispatch failure.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream transport error: {0}")]
    Transport(String),
}

/// HTTP client for the registered provider bindings.
pub struct UpstreamClient {
    client: reqwest::Client,
    bindings: HashMap<Provider, ProviderBinding>,
}

impl UpstreamClient {
    pub fn new(
        bindings: Vec<ProviderBinding>,
        timeout_ms: u64,
        connect_timeout_ms: u64,
    ) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .connect_timeout(Duration::from_millis(connect_timeout_ms))
            .build()
            .map_err(|e| UpstreamError::Transport(format!("failed to build client: {e}")))?;

        Ok(Self {
            client,
            bindings: bindings.into_iter().map(|b| (b.provider, b)).collect(),
        })
    }

    pub fn binding(&self, provider: Provider) -> Option<&ProviderBinding> {
        self.bindings.get(&provider)
    }

    /// Forward a request to `provider`'s upstream and buffer the response.
    pub async fn send(
        &self,
        provider: Provider,
        method: &Method,
        path: &str,
        query: Option<&str>,
        inbound_headers: &HeaderMap,
        body: Option<&Value>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let binding = self.bindings.get(&provider).ok_or_else(|| {
            UpstreamError::Transport(format!("no binding registered for {provider}"))
        })?;

        let url = build_url(&binding.upstream_base_url, path, query);
        let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| UpstreamError::Transport(format!("invalid method: {e}")))?;

        let has_body = body.is_some() && method != reqwest::Method::GET && method != reqwest::Method::HEAD;

        let mut request = self
            .client
            .request(method, &url)
            .headers(prepare_headers(inbound_headers, binding, has_body));

        if has_body {
            let body = body.expect("has_body implies body is present");
            let bytes = serde_json::to_vec(body)
                .map_err(|e| UpstreamError::Transport(format!("body serialisation: {e}")))?;
            request = request.body(bytes);
        }

        debug!(%provider, %url, "Dispatching upstream request");

        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = convert_headers(response.headers());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::Transport(format!("reading response body: {e}")))?;
        let body_json = serde_json::from_slice(&bytes).ok();

        Ok(UpstreamResponse {
            status,
            headers,
            body: bytes,
            body_json,
        })
    }
}

fn build_url(base: &str, path: &str, query: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    match query {
        Some(q) => format!("{base}{path}?{q}"),
        None => format!("{base}{path}"),
    }
}

/// Whitelist copy of inbound headers plus credential and framing overrides.
fn prepare_headers(
    inbound: &HeaderMap,
    binding: &ProviderBinding,
    has_body: bool,
) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();

    for name in FORWARDED_HEADERS {
        if let Some(value) = inbound.get(*name) {
            if let (Ok(rname), Ok(rvalue)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                out.insert(rname, rvalue);
            }
        }
    }

    // Avoid compressed framing the buffered relay would have to undo.
    out.insert(
        reqwest::header::ACCEPT_ENCODING,
        reqwest::header::HeaderValue::from_static("identity"),
    );

    if has_body && !out.contains_key(reqwest::header::CONTENT_TYPE) {
        out.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
    }

    match binding.auth_style {
        AuthStyle::Bearer => {
            if let Ok(value) = reqwest::header::HeaderValue::from_str(&format!(
                "Bearer {}",
                binding.api_key
            )) {
                out.insert(reqwest::header::AUTHORIZATION, value);
            }
        }
        AuthStyle::HeaderPair => {
            if let Ok(value) = reqwest::header::HeaderValue::from_str(&binding.api_key) {
                out.insert("x-api-key", value);
            }
            out.insert(
                "anthropic-version",
                reqwest::header::HeaderValue::from_static(ANTHROPIC_VERSION),
            );
        }
    }

    out
}

/// Convert reqwest response headers back into axum's header map.
fn convert_headers(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if let (Ok(aname), Ok(avalue)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.insert(aname, avalue);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
