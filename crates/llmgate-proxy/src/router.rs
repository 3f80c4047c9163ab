//! URL namespace routing.
//!
//! Observability endpoints get explicit routes; everything else falls
//! through to the proxy pipeline, which recognises `/<provider>/<path>`
//! prefixes and 404s the rest.

use crate::pipeline::{proxy_handler, AppState};
use crate::{api, ws};
use axum::routing::{any, get};
use axum::Router;
use llmgate_core::Provider;
use std::str::FromStr;
use std::sync::Arc;

/// Split `/<provider>/<upstream-path>` into the provider and the stripped
/// path. Returns `None` for unregistered prefixes.
pub fn split_provider(path: &str) -> Option<(Provider, String)> {
    let trimmed = path.strip_prefix('/')?;
    let (first, rest) = match trimmed.split_once('/') {
        Some((first, rest)) => (first, rest),
        None => (trimmed, ""),
    };
    let provider = Provider::from_str(first).ok()?;
    Some((provider, format!("/{rest}")))
}

/// Build the full route table.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/stats", get(api::stats))
        .route("/logs", get(api::logs_recent))
        .route("/logs/:action", get(api::logs_by_action))
        .route("/dashboard/metrics", get(api::dashboard_metrics))
        .route("/dashboard/analytics", get(api::dashboard_analytics))
        .route("/dashboard/rate-limits", get(api::rate_limits))
        .route(
            "/dashboard/rate-limits/:id",
            get(api::rate_limit_status).delete(api::rate_limit_reset),
        )
        .route("/ws", get(ws::ws_handler))
        // everything else is a provider proxy request
        .fallback(any(proxy_handler))
        .with_state(state)
}
