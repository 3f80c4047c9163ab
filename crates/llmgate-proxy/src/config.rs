//! Configuration loading: YAML file, environment overrides, validation.
//!
//! Precedence (highest wins): CLI flags, environment variables, config
//! file, built-in defaults. The environment surface uses the deployment's
//! established key names (`PORT`, `ENABLE_*`, `RATE_LIMIT_*`, provider
//! URL/key pairs) rather than a single prefixed namespace.

use llmgate_core::{GateError, ProxyConfig, Result, SanitizeMode};
use std::path::Path;

/// Load a [`ProxyConfig`] from a YAML file at `path`.
pub fn load_config(path: &Path) -> Result<ProxyConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        GateError::Config(format!("failed to read config file {}: {e}", path.display()))
    })?;
    serde_yaml::from_str(&contents)
        .map_err(|e| GateError::Config(format!("failed to parse config YAML: {e}")))
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(config: &mut ProxyConfig) {
    apply_overrides(config, &|key| std::env::var(key).ok());
}

/// Apply overrides from an arbitrary key lookup (tests inject a map).
pub fn apply_overrides(config: &mut ProxyConfig, lookup: &dyn Fn(&str) -> Option<String>) {
    if let Some(port) = lookup("PORT").and_then(|v| v.parse().ok()) {
        config.port = port;
    }

    if let Some(url) = lookup("OPENAI_API_URL") {
        config.openai.api_url = Some(url);
    }
    if let Some(key) = lookup("OPENAI_API_KEY") {
        config.openai.api_key = Some(key);
    }
    if let Some(url) = lookup("ANTHROPIC_API_URL") {
        config.anthropic.api_url = Some(url);
    }
    if let Some(key) = lookup("ANTHROPIC_API_KEY") {
        config.anthropic.api_key = Some(key);
    }

    let flags = &mut config.features;
    if let Some(v) = lookup("ENABLE_DATA_SANITIZATION").and_then(|v| parse_bool(&v)) {
        flags.data_sanitization = v;
    }
    if let Some(v) = lookup("ENABLE_TIME_BASED_BLOCKING").and_then(|v| parse_bool(&v)) {
        flags.time_based_blocking = v;
    }
    if let Some(v) = lookup("ENABLE_CACHING").and_then(|v| parse_bool(&v)) {
        flags.caching = v;
    }
    if let Some(v) = lookup("ENABLE_POLICY_ENFORCEMENT").and_then(|v| parse_bool(&v)) {
        flags.policy_enforcement = v;
    }
    if let Some(v) = lookup("ENABLE_RATE_LIMITING").and_then(|v| parse_bool(&v)) {
        flags.rate_limiting = v;
    }

    if let Some(v) = lookup("FINANCIAL_DETECTION_STRICT").and_then(|v| parse_bool(&v)) {
        config.financial_detection_strict = v;
    }
    if let Some(mode) = lookup("SANITIZE_MODE") {
        match mode.to_lowercase().as_str() {
            "redact" => config.sanitize_mode = SanitizeMode::Redact,
            "reject" => config.sanitize_mode = SanitizeMode::Reject,
            _ => {}
        }
    }

    if let Some(ttl) = lookup("CACHE_TTL").and_then(|v| v.parse().ok()) {
        config.cache_ttl_secs = ttl;
    }
    if let Some(v) = lookup("RATE_LIMIT_MAX_TOKENS").and_then(|v| v.parse().ok()) {
        config.rate_limit.max_tokens = v;
    }
    if let Some(v) = lookup("RATE_LIMIT_REFILL_RATE").and_then(|v| v.parse().ok()) {
        config.rate_limit.refill_rate = v;
    }
    if let Some(v) = lookup("RATE_LIMIT_REFILL_INTERVAL").and_then(|v| v.parse().ok()) {
        config.rate_limit.refill_interval_ms = v;
    }
    if let Some(v) = lookup("UPSTREAM_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.upstream_timeout_ms = v;
    }

    if let Some(url) = lookup("CLASSIFIER_API_URL") {
        config.classifier.api_url = url;
    }
    if let Some(key) = lookup("CLASSIFIER_API_KEY") {
        config.classifier.api_key = key;
    }
    if let Some(model) = lookup("CLASSIFIER_MODEL") {
        config.classifier.model = model;
    }

    if let Some(profile) = lookup("LLMGATE_STORAGE_PROFILE") {
        config.storage.profile = profile;
    }
    if let Some(path) = lookup("LLMGATE_DATABASE_PATH") {
        config.storage.database_path = path;
    }
    if let Some(level) = lookup("LLMGATE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(format) = lookup("LLMGATE_LOG_FORMAT") {
        config.logging.format = format;
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Validate a resolved configuration before startup.
pub fn validate_config(config: &ProxyConfig) -> Result<()> {
    if config.port == 0 {
        return Err(GateError::Config("port must be non-zero".to_string()));
    }
    if config.cache_ttl_secs == 0 {
        return Err(GateError::Config("cache TTL must be positive".to_string()));
    }
    if config.rate_limit.max_tokens <= 0.0 {
        return Err(GateError::Config(
            "rate limit capacity must be positive".to_string(),
        ));
    }
    if config.rate_limit.refill_rate <= 0.0 {
        return Err(GateError::Config(
            "rate limit refill rate must be positive".to_string(),
        ));
    }
    if config.rate_limit.refill_interval_ms == 0 {
        return Err(GateError::Config(
            "rate limit refill interval must be positive".to_string(),
        ));
    }
    match config.storage.profile.as_str() {
        "lite" | "memory" => {}
        other => {
            return Err(GateError::Config(format!(
                "unknown storage profile: {other}"
            )))
        }
    }
    match config.logging.format.as_str() {
        "text" | "json" => {}
        other => return Err(GateError::Config(format!("unknown log format: {other}"))),
    }
    Ok(())
}
