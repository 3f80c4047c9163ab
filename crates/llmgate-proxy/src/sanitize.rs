//! Sensitive-data scanning of request bodies.
//!
//! The request body is walked as a JSON tree; every string leaf is handed to
//! the detector, which asks the external classifier for email / IPv4 / IBAN
//! instances and validates each returned instance against its category's
//! pattern before counting it. Classifier failures detect nothing; this
//! stage fails open.
//!
//! Two strategies share the detector behind [`SanitizeStrategy`]:
//! [`RejectOnDetect`] (deployed default) terminates the request, while
//! [`RedactAndForward`] substitutes placeholders and lets the request
//! continue. Both produce a redacted rendering so the audit log never
//! stores sensitive strings.

use crate::classifier::CompletionClient;
use async_trait::async_trait;
use llmgate_core::{GateError, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

/// A category of sensitive identifier the detector recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Category {
    Email,
    Ipv4,
    Iban,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Email => "email",
            Category::Ipv4 => "ipv4",
            Category::Iban => "iban",
        }
    }

    /// Placeholder substituted for detected instances of this category.
    pub fn placeholder(&self) -> &'static str {
        match self {
            Category::Email => "EMAIL_PH",
            Category::Ipv4 => "IP_ADDRESS_PH",
            Category::Iban => "IBAN_PH",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Pure tree traversal
// ---------------------------------------------------------------------------

/// Collect every string leaf in the tree. Object keys are never inspected.
pub fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_strings(item, out);
            }
        }
        _ => {}
    }
}

/// Rebuild the tree with `f` applied to every string leaf.
///
/// The input is never mutated; a new tree is returned.
pub fn map_strings(value: &Value, f: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(s)),
        Value::Array(items) => Value::Array(items.iter().map(|v| map_strings(v, f)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), map_strings(v, f)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

const DETECTION_PROMPT: &str = "You are a data-loss-prevention scanner. Given a text, \
extract every email address, IPv4 address, and IBAN it contains. Reply with only a JSON \
object of the form {\"emails\": [], \"ip_addresses\": [], \"ibans\": []} listing the exact \
strings found. Reply with empty lists when nothing is found.";

/// The classifier's raw reply shape.
#[derive(Debug, Default, Deserialize)]
struct DetectionReply {
    #[serde(default)]
    emails: Vec<String>,
    #[serde(default)]
    ip_addresses: Vec<String>,
    #[serde(default)]
    ibans: Vec<String>,
}

/// Validated instances found in a text, grouped by category.
#[derive(Debug, Default, Clone)]
pub struct DetectedInstances {
    pub emails: Vec<String>,
    pub ip_addresses: Vec<String>,
    pub ibans: Vec<String>,
}

impl DetectedInstances {
    pub fn is_empty(&self) -> bool {
        self.emails.is_empty() && self.ip_addresses.is_empty() && self.ibans.is_empty()
    }

    /// The categories with at least one instance.
    pub fn categories(&self) -> BTreeSet<Category> {
        let mut out = BTreeSet::new();
        if !self.emails.is_empty() {
            out.insert(Category::Email);
        }
        if !self.ip_addresses.is_empty() {
            out.insert(Category::Ipv4);
        }
        if !self.ibans.is_empty() {
            out.insert(Category::Iban);
        }
        out
    }

    fn merge(&mut self, other: DetectedInstances) {
        self.emails.extend(other.emails);
        self.ip_addresses.extend(other.ip_addresses);
        self.ibans.extend(other.ibans);
    }
}

/// LLM-backed detector with per-category validation.
pub struct SensitiveDataDetector {
    llm: Arc<dyn CompletionClient>,
    email_re: Regex,
    ipv4_re: Regex,
    iban_re: Regex,
}

impl SensitiveDataDetector {
    pub fn new(llm: Arc<dyn CompletionClient>) -> Result<Self> {
        let email_re = Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$")
            .map_err(|e| GateError::Config(format!("invalid email pattern: {e}")))?;
        let ipv4_re = Regex::new(
            r"^(25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)(\.(25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)){3}$",
        )
        .map_err(|e| GateError::Config(format!("invalid ipv4 pattern: {e}")))?;
        let iban_re = Regex::new(r"^[A-Z]{2}\d{2}[A-Z0-9]{11,30}$")
            .map_err(|e| GateError::Config(format!("invalid iban pattern: {e}")))?;

        Ok(Self {
            llm,
            email_re,
            ipv4_re,
            iban_re,
        })
    }

    /// Scan one text. Classifier failure returns no instances.
    pub async fn detect(&self, text: &str) -> DetectedInstances {
        let reply = match self.llm.complete(DETECTION_PROMPT, text).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Sensitive-data classifier failed, detecting nothing: {e}");
                return DetectedInstances::default();
            }
        };

        let parsed: DetectionReply = match serde_json::from_str(strip_code_fences(&reply)) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Sensitive-data classifier reply was not valid JSON: {e}");
                return DetectedInstances::default();
            }
        };

        DetectedInstances {
            emails: self.validate(parsed.emails, &self.email_re),
            ip_addresses: self.validate(parsed.ip_addresses, &self.ipv4_re),
            ibans: self.validate(parsed.ibans, &self.iban_re),
        }
    }

    /// Scan every string leaf of a body tree and merge the results.
    pub async fn detect_in_body(&self, body: &Value) -> DetectedInstances {
        let mut leaves = Vec::new();
        collect_strings(body, &mut leaves);

        let mut merged = DetectedInstances::default();
        for leaf in &leaves {
            merged.merge(self.detect(leaf).await);
        }
        merged
    }

    fn validate(&self, candidates: Vec<String>, pattern: &Regex) -> Vec<String> {
        candidates
            .into_iter()
            .filter(|c| pattern.is_match(c.trim()))
            .collect()
    }
}

/// Models sometimes wrap JSON replies in markdown fences.
fn strip_code_fences(reply: &str) -> &str {
    let trimmed = reply.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// Substitute the category placeholder for every detected instance.
pub fn redact_body(body: &Value, instances: &DetectedInstances) -> Value {
    map_strings(body, &|s: &str| {
        let mut out = s.to_string();
        for email in &instances.emails {
            out = out.replace(email, Category::Email.placeholder());
        }
        for ip in &instances.ip_addresses {
            out = out.replace(ip, Category::Ipv4.placeholder());
        }
        for iban in &instances.ibans {
            out = out.replace(iban, Category::Iban.placeholder());
        }
        out
    })
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Result of applying a sanitisation strategy to a request body.
#[derive(Debug, Clone)]
pub enum SanitizeOutcome {
    /// Nothing detected; the body passes through unchanged.
    Clean,
    /// Sensitive data found; the request must not proceed. Carries the
    /// redacted rendering for the audit log.
    Rejected {
        detected: BTreeSet<Category>,
        redacted_body: Value,
    },
    /// Sensitive data found and substituted; the rewritten body is forwarded.
    Redacted { body: Value },
}

/// A sanitisation strategy selected at startup.
#[async_trait]
pub trait SanitizeStrategy: Send + Sync {
    async fn apply(&self, body: &Value) -> SanitizeOutcome;
}

/// Deployed default: terminate the request when sensitive data is found.
pub struct RejectOnDetect {
    detector: SensitiveDataDetector,
}

impl RejectOnDetect {
    pub fn new(detector: SensitiveDataDetector) -> Self {
        Self { detector }
    }
}

#[async_trait]
impl SanitizeStrategy for RejectOnDetect {
    async fn apply(&self, body: &Value) -> SanitizeOutcome {
        let instances = self.detector.detect_in_body(body).await;
        if instances.is_empty() {
            return SanitizeOutcome::Clean;
        }
        SanitizeOutcome::Rejected {
            detected: instances.categories(),
            redacted_body: redact_body(body, &instances),
        }
    }
}

/// Alternative strategy: rewrite the body with placeholders and forward it.
pub struct RedactAndForward {
    detector: SensitiveDataDetector,
}

impl RedactAndForward {
    pub fn new(detector: SensitiveDataDetector) -> Self {
        Self { detector }
    }
}

#[async_trait]
impl SanitizeStrategy for RedactAndForward {
    async fn apply(&self, body: &Value) -> SanitizeOutcome {
        let instances = self.detector.detect_in_body(body).await;
        if instances.is_empty() {
            return SanitizeOutcome::Clean;
        }
        SanitizeOutcome::Redacted {
            body: redact_body(body, &instances),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
