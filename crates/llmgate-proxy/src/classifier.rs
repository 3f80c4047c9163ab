//! External LLM completion client.
//!
//! Both the sensitive-data detector and the financial-policy classifier
//! delegate their judgement calls to an external model through this trait.
//! The HTTP implementation speaks the OpenAI chat-completions format at
//! temperature 0; the scripted implementation feeds canned replies to tests.

use async_trait::async_trait;
use llmgate_core::{ClassifierConfig, GateError, Result};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// A single-turn completion against the classification model.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Run one completion and return the raw reply text.
    async fn complete(&self, system_prompt: &str, user_text: &str) -> Result<String>;

    /// Whether the client has a usable credential.
    fn is_configured(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Chat-completions client for the configured classification endpoint.
pub struct HttpCompletionClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl HttpCompletionClient {
    pub fn new(config: &ClassifierConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| GateError::Classifier(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, system_prompt: &str, user_text: &str) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.api_url);
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_text },
            ],
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GateError::Classifier(format!("classification request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GateError::Classifier(format!(
                "classification endpoint returned {status}"
            )));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| GateError::Classifier(format!("invalid classification response: {e}")))?;

        let reply = parsed["choices"]
            .as_array()
            .and_then(|choices| choices.first())
            .and_then(|choice| choice["message"]["content"].as_str())
            .ok_or_else(|| {
                GateError::Classifier("classification response had no content".to_string())
            })?;

        debug!(model = %self.model, reply_len = reply.len(), "Classification reply received");
        Ok(reply.to_string())
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Scripted implementation for tests
// ---------------------------------------------------------------------------

/// Deterministic [`CompletionClient`] that replays queued replies.
///
/// Calls beyond the queued replies return a classifier error, which
/// exercises the fail-open/fallback paths.
pub struct ScriptedCompletionClient {
    replies: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
}

impl ScriptedCompletionClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            calls: AtomicUsize::new(0),
        }
    }

    /// A client whose every call fails.
    pub fn failing() -> Self {
        Self::new(Vec::<String>::new())
    }

    /// Number of completions requested so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Queue another reply.
    pub fn push(&self, reply: impl Into<String>) {
        self.replies.lock().unwrap().push_back(reply.into());
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletionClient {
    async fn complete(&self, _system_prompt: &str, _user_text: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| GateError::Classifier("no scripted reply queued".to_string()))
    }
}
