//! JSON error response bodies.
//!
//! Every blocked or fatal outcome returns the same envelope:
//! `{"error": {"message", "code", "timestamp", "path", "method", ...}}`.
//! The `code` values are stable; downstream clients match on them.

use axum::body::Body;
use axum::http::{Response, StatusCode};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

/// Stable error codes carried in the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BlockedRateLimit,
    TimeBlocked,
    SensitiveDataBlocked,
    FinancialBlocked,
    InternalError,
    UnknownProvider,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BlockedRateLimit => "BLOCKED_RATE_LIMIT",
            ErrorCode::TimeBlocked => "TIME_BLOCKED",
            ErrorCode::SensitiveDataBlocked => "SENSITIVE_DATA_BLOCKED",
            ErrorCode::FinancialBlocked => "FINANCIAL_BLOCKED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::UnknownProvider => "UNKNOWN_PROVIDER",
        }
    }

    /// HTTP status the code maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::BlockedRateLimit => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::TimeBlocked
            | ErrorCode::SensitiveDataBlocked
            | ErrorCode::FinancialBlocked => StatusCode::FORBIDDEN,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::UnknownProvider => StatusCode::NOT_FOUND,
        }
    }
}

/// Build the error response for `code`, with optional extra detail fields.
pub fn error_response(
    code: ErrorCode,
    message: &str,
    path: &str,
    method: &str,
    at: DateTime<Utc>,
    details: Option<Value>,
) -> Response<Body> {
    let mut error = json!({
        "message": message,
        "code": code.as_str(),
        "timestamp": at.to_rfc3339(),
        "path": path,
        "method": method,
    });
    if let Some(details) = details {
        error["details"] = details;
    }
    let body = json!({ "error": error });

    Response::builder()
        .status(code.status())
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("static error response must build")
}
