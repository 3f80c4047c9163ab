//! Core types, traits, and errors for LLMGate
//!
//! This crate contains the foundational types shared across all LLMGate
//! components: provider identities and credential bindings, audit records
//! and the audit store interface, the clock abstraction used by the
//! time-sensitive pipeline stages, and the proxy configuration tree.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// A registered upstream LLM provider namespace.
///
/// The set is closed: each variant corresponds to one URL prefix the router
/// recognises (`/openai/...`, `/anthropic/...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
}

impl Provider {
    /// The stable lowercase name used in URLs, audit rows, and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
        }
    }

    /// All registered providers.
    pub fn all() -> [Provider; 2] {
        [Provider::OpenAi, Provider::Anthropic]
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "openai" => Ok(Provider::OpenAi),
            "anthropic" => Ok(Provider::Anthropic),
            other => Err(GateError::Config(format!("unknown provider: {other}"))),
        }
    }
}

/// How a provider credential is injected into the outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `x-api-key: <key>` plus the provider's protocol-version header.
    HeaderPair,
}

/// Static binding of a provider to its upstream endpoint and credential.
///
/// Created once at startup from configuration; immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderBinding {
    pub provider: Provider,
    /// Base URL the upstream path is appended to (no trailing slash).
    pub upstream_base_url: String,
    /// The credential substituted for whatever the client sent.
    pub api_key: String,
    pub auth_style: AuthStyle,
}

// ---------------------------------------------------------------------------
// Audit records
// ---------------------------------------------------------------------------

/// Terminal outcome of one proxied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Proxied,
    BlockedTime,
    BlockedFinancial,
    BlockedRateLimit,
    BlockedSensitiveData,
    ServedFromCache,
}

impl AuditAction {
    /// The stable string form stored in the audit log.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Proxied => "PROXIED",
            AuditAction::BlockedTime => "BLOCKED_TIME",
            AuditAction::BlockedFinancial => "BLOCKED_FINANCIAL",
            AuditAction::BlockedRateLimit => "BLOCKED_RATE_LIMIT",
            AuditAction::BlockedSensitiveData => "BLOCKED_SENSITIVE_DATA",
            AuditAction::ServedFromCache => "SERVED_FROM_CACHE",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PROXIED" => Ok(AuditAction::Proxied),
            "BLOCKED_TIME" => Ok(AuditAction::BlockedTime),
            "BLOCKED_FINANCIAL" => Ok(AuditAction::BlockedFinancial),
            "BLOCKED_RATE_LIMIT" => Ok(AuditAction::BlockedRateLimit),
            "BLOCKED_SENSITIVE_DATA" => Ok(AuditAction::BlockedSensitiveData),
            "SERVED_FROM_CACHE" => Ok(AuditAction::ServedFromCache),
            other => Err(GateError::Storage(format!("unknown audit action: {other}"))),
        }
    }
}

/// One row in the audit log; exactly one is produced per inbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique identifier for this record.
    pub id: Uuid,
    /// When the request was received.
    pub timestamp: DateTime<Utc>,
    /// Provider namespace the request addressed.
    pub provider: Provider,
    /// Upstream path (provider prefix stripped).
    pub endpoint: String,
    /// Terminal outcome.
    pub action: AuditAction,
    /// Request body serialised after sanitisation; never contains
    /// sensitive strings.
    pub anonymized_payload: String,
    /// Wall-clock milliseconds from receipt to response, when the request
    /// reached the upstream or the cache.
    pub response_time_ms: Option<i64>,
    /// Underlying cause for requests that failed in transit.
    pub error_message: Option<String>,
}

impl AuditRecord {
    /// Create a new record with a fresh id.
    pub fn new(
        timestamp: DateTime<Utc>,
        provider: Provider,
        endpoint: String,
        action: AuditAction,
        anonymized_payload: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            provider,
            endpoint,
            action,
            anonymized_payload,
            response_time_ms: None,
            error_message: None,
        }
    }

    /// Attach the measured response time.
    pub fn with_response_time(mut self, ms: i64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }

    /// Attach an error cause.
    pub fn with_error(mut self, message: String) -> Self {
        self.error_message = Some(message);
        self
    }
}

/// Aggregate statistics over the audit log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStats {
    /// Total number of records.
    pub total: u64,
    /// Record counts keyed by action string.
    pub by_action: HashMap<String, u64>,
    /// Record counts keyed by provider name.
    pub by_provider: HashMap<String, u64>,
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditStore: Send + Sync {
    /// Append one record.
    async fn record(&self, record: &AuditRecord) -> Result<()>;

    /// The most recent records, newest first.
    async fn recent(&self, limit: u32) -> Result<Vec<AuditRecord>>;

    /// The most recent records with the given action, newest first.
    async fn by_action(&self, action: AuditAction, limit: u32) -> Result<Vec<AuditRecord>>;

    /// Aggregate counts across the whole log.
    async fn stats(&self) -> Result<AuditStats>;

    /// Health check for the backend.
    async fn health_check(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of wall-clock time for time-sensitive components.
///
/// The time gate and the rate limiter read the clock through this trait so
/// tests can freeze or advance it deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually driven clock for tests.
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
        }
    }

    /// Jump to an absolute instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap() = instant;
    }

    /// Move forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-request interception feature flags. All default to enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub data_sanitization: bool,
    pub time_based_blocking: bool,
    pub caching: bool,
    pub policy_enforcement: bool,
    pub rate_limiting: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            data_sanitization: true,
            time_based_blocking: true,
            caching: true,
            policy_enforcement: true,
            rate_limiting: true,
        }
    }
}

/// Token-bucket rate limiter parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket capacity.
    pub max_tokens: f64,
    /// Tokens added per elapsed refill interval.
    pub refill_rate: f64,
    /// Refill granularity in milliseconds.
    pub refill_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100.0,
            refill_rate: 10.0,
            refill_interval_ms: 1_000,
        }
    }
}

/// Endpoint and credential for one provider namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
}

/// External LLM used by the sanitiser and the policy classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_ms: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            timeout_ms: 30_000,
        }
    }
}

/// Audit store backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `lite` (SQLite file) or `memory`.
    pub profile: String,
    /// SQLite database path for the `lite` profile.
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            profile: "lite".to_string(),
            database_path: "llmgate.db".to_string(),
        }
    }
}

/// Structured logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (trace, debug, info, warn, error).
    pub level: String,
    /// Output format: `text` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Which sanitiser strategy a deployment runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SanitizeMode {
    /// Reject the request when sensitive data is detected (deployed default).
    Reject,
    /// Replace detected instances with placeholders and forward.
    Redact,
}

impl Default for SanitizeMode {
    fn default() -> Self {
        SanitizeMode::Reject
    }
}

/// Top-level proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Interface to bind.
    pub host: String,
    /// Port to bind; successive ports are probed when taken.
    pub port: u16,
    pub features: FeatureFlags,
    pub openai: ProviderConfig,
    pub anthropic: ProviderConfig,
    /// Cache entry lifetime in seconds.
    pub cache_ttl_secs: u64,
    pub rate_limit: RateLimitConfig,
    pub sanitize_mode: SanitizeMode,
    /// Second classification pass for borderline financial texts.
    pub financial_detection_strict: bool,
    pub classifier: ClassifierConfig,
    /// Upstream request deadline in milliseconds.
    pub upstream_timeout_ms: u64,
    pub connection_timeout_ms: u64,
    pub max_request_size_bytes: u64,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    /// Seconds to wait for in-flight work on shutdown.
    pub shutdown_timeout_seconds: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            features: FeatureFlags::default(),
            openai: ProviderConfig::default(),
            anthropic: ProviderConfig::default(),
            cache_ttl_secs: 300,
            rate_limit: RateLimitConfig::default(),
            sanitize_mode: SanitizeMode::default(),
            financial_detection_strict: false,
            classifier: ClassifierConfig::default(),
            upstream_timeout_ms: 30_000,
            connection_timeout_ms: 5_000,
            max_request_size_bytes: 50 * 1024 * 1024,
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            shutdown_timeout_seconds: 30,
        }
    }
}

impl ProxyConfig {
    /// Resolve the static provider bindings from configuration.
    ///
    /// A provider with no configured URL falls back to its public endpoint;
    /// a missing key yields an empty credential (requests will be rejected
    /// upstream, not by the proxy).
    pub fn bindings(&self) -> Vec<ProviderBinding> {
        let openai = ProviderBinding {
            provider: Provider::OpenAi,
            upstream_base_url: self
                .openai
                .api_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key: self.openai.api_key.clone().unwrap_or_default(),
            auth_style: AuthStyle::Bearer,
        };
        let anthropic = ProviderBinding {
            provider: Provider::Anthropic,
            upstream_base_url: self
                .anthropic
                .api_url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            api_key: self.anthropic.api_key.clone().unwrap_or_default(),
            auth_style: AuthStyle::HeaderPair,
        };
        vec![openai, anthropic]
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Core error types.
#[derive(thiserror::Error, Debug)]
pub enum GateError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GateError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
