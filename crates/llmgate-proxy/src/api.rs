//! REST observability endpoints.
//!
//! Read-side queries over the audit store plus dashboard views of the
//! cache, the rate limiter, and system metrics. These endpoints serve the
//! operational dashboard; the proxy surface itself is the fallback route.

use crate::events::SystemMetrics;
use crate::pipeline::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use llmgate_core::AuditAction;
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use tracing::error;

/// Default page size for log queries.
const DEFAULT_LOG_LIMIT: u32 = 50;

/// Maximum page size for log queries.
const MAX_LOG_LIMIT: u32 = 1000;

/// Query parameters for the log endpoints.
#[derive(Debug, Deserialize)]
pub struct LogParams {
    pub limit: Option<u32>,
}

fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT)
}

/// Build a JSON error response.
fn api_error(status: StatusCode, message: &str) -> Response {
    let body = json!({
        "error": { "message": message, "type": "api_error" }
    });
    (status, Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` — feature flags, component health, endpoint list.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let storage_healthy = state.store.health_check().await.is_ok();
    let flags = &state.config.features;

    let body = json!({
        "status": if storage_healthy { "healthy" } else { "degraded" },
        "features": {
            "data_sanitization": flags.data_sanitization,
            "time_based_blocking": flags.time_based_blocking,
            "caching": flags.caching,
            "policy_enforcement": flags.policy_enforcement,
            "rate_limiting": flags.rate_limiting,
        },
        "storage": { "healthy": storage_healthy },
        "classifier": { "configured": state.classifier_configured },
        "endpoints": [
            "/<provider>/<upstream-path>",
            "/health",
            "/stats",
            "/logs",
            "/logs/:action",
            "/dashboard/metrics",
            "/dashboard/analytics",
            "/dashboard/rate-limits",
            "/ws",
        ],
    });
    Json(body).into_response()
}

/// `GET /stats` — aggregate audit statistics.
pub async fn stats(State(state): State<Arc<AppState>>) -> Response {
    match state.store.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            error!("Failed to read audit stats: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to read stats")
        }
    }
}

/// `GET /logs?limit=` — most recent audit records.
pub async fn logs_recent(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogParams>,
) -> Response {
    match state.store.recent(clamp_limit(params.limit)).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => {
            error!("Failed to read audit log: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to read logs")
        }
    }
}

/// `GET /logs/:action?limit=` — recent records with one action.
pub async fn logs_by_action(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
    Query(params): Query<LogParams>,
) -> Response {
    let Ok(action) = AuditAction::from_str(&action) else {
        return api_error(StatusCode::BAD_REQUEST, "unknown action");
    };
    match state.store.by_action(action, clamp_limit(params.limit)).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => {
            error!("Failed to read audit log: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to read logs")
        }
    }
}

/// `GET /dashboard/metrics` — cache + system + rate limiter snapshot.
pub async fn dashboard_metrics(State(state): State<Arc<AppState>>) -> Response {
    let body = json!({
        "at": state.clock.now().to_rfc3339(),
        "cache": state.cache.stats(),
        "rate_limits": state.limiter.stats(),
        "system": SystemMetrics::sample(),
    });
    Json(body).into_response()
}

/// `GET /dashboard/analytics` — aggregated analytics view.
pub async fn dashboard_analytics(State(state): State<Arc<AppState>>) -> Response {
    let totals = match state.store.stats().await {
        Ok(totals) => totals,
        Err(e) => {
            error!("Failed to read audit stats: {e}");
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to read stats");
        }
    };
    let body = json!({
        "at": state.clock.now().to_rfc3339(),
        "totals": totals,
        "cache": state.cache.stats(),
        "recent_activity": state.events.activity_series(),
    });
    Json(body).into_response()
}

/// `GET /dashboard/rate-limits` — aggregate limiter state.
pub async fn rate_limits(State(state): State<Arc<AppState>>) -> Response {
    Json(state.limiter.stats()).into_response()
}

/// `GET /dashboard/rate-limits/:id` — one identity's bucket projection.
pub async fn rate_limit_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    Json(state.limiter.status(&id)).into_response()
}

/// `DELETE /dashboard/rate-limits/:id` — drop one identity's bucket.
pub async fn rate_limit_reset(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    if state.limiter.reset(&id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        api_error(StatusCode::NOT_FOUND, "no rate limit state for identity")
    }
}
