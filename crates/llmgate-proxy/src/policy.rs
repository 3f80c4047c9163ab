//! Financial-content policy classification.
//!
//! Three-layer decision: an unambiguous keyword dictionary answers
//! immediately without an LLM call; otherwise the external classifier is
//! asked for a single-token verdict; in strict mode borderline texts
//! (general economic vocabulary without an unambiguous term) need a second,
//! stricter pass to agree. Classifier errors fall back to the keyword
//! result.

use crate::classifier::CompletionClient;
use std::sync::Arc;
use tracing::{debug, warn};

/// Terms that are financial on their own; no model call needed.
const FINANCIAL_KEYWORDS: &[&str] = &[
    // banking / accounts
    "bank account",
    "banking",
    "checking account",
    "savings account",
    "wire transfer",
    "account balance",
    "routing number",
    // credit / lending
    "loan",
    "mortgage",
    "credit card",
    "credit score",
    "interest rate",
    "refinanc",
    // investing
    "investment",
    "investing",
    "stock market",
    "stocks",
    "bonds",
    "portfolio",
    "dividend",
    "mutual fund",
    "etf",
    // insurance
    "insurance",
    "premium payment",
    // crypto
    "cryptocurrency",
    "bitcoin",
    "ethereum",
    "crypto wallet",
    // tax
    "tax return",
    "tax filing",
    "taxes",
    "irs",
    // payments
    "payment",
    "paycheck",
    "payroll",
    "invoice",
];

/// General economic vocabulary. Present without any keyword above it makes a
/// text borderline.
const ECONOMIC_CONTEXT_WORDS: &[&str] = &[
    "money", "market", "economy", "economic", "price", "prices", "cost", "budget", "salary",
    "income", "spending",
];

const CLASSIFY_PROMPT: &str = "You are a content policy classifier. Decide whether the \
user's text is about financial services, personal finance, or financial transactions. \
Reply with exactly one token: FINANCIAL or NON_FINANCIAL.";

const STRICT_PROMPT: &str = "You are a strict content policy classifier. Only texts whose \
primary subject is financial services, personal finance, or financial transactions count. \
Passing mentions of money or the economy do not. Reply with exactly one token: FINANCIAL \
or NON_FINANCIAL.";

/// Classifies extracted request text as financial / non-financial.
pub struct PolicyClassifier {
    llm: Arc<dyn CompletionClient>,
    strict: bool,
}

impl PolicyClassifier {
    pub fn new(llm: Arc<dyn CompletionClient>, strict: bool) -> Self {
        Self { llm, strict }
    }

    /// Dictionary check: `true` only for unambiguous financial terms.
    pub fn keyword_hit(text: &str) -> bool {
        let lower = text.to_lowercase();
        FINANCIAL_KEYWORDS.iter().any(|kw| lower.contains(kw))
    }

    /// Borderline: economic vocabulary present, unambiguous terms absent.
    pub fn is_borderline(text: &str) -> bool {
        if Self::keyword_hit(text) {
            return false;
        }
        let lower = text.to_lowercase();
        ECONOMIC_CONTEXT_WORDS.iter().any(|w| lower.contains(w))
    }

    /// Whether `text` is financial content.
    pub async fn is_financial(&self, text: &str) -> bool {
        if Self::keyword_hit(text) {
            debug!("Financial keyword hit, skipping classifier");
            return true;
        }

        let first = match self.classify(CLASSIFY_PROMPT, text).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("Policy classifier failed, falling back to keyword result: {e}");
                return false;
            }
        };

        if !first {
            return false;
        }

        if self.strict && Self::is_borderline(text) {
            match self.classify(STRICT_PROMPT, text).await {
                Ok(second) => return second,
                Err(e) => {
                    warn!("Strict-pass classifier failed, falling back to keyword result: {e}");
                    return false;
                }
            }
        }

        true
    }

    async fn classify(&self, prompt: &str, text: &str) -> llmgate_core::Result<bool> {
        let reply = self.llm.complete(prompt, text).await?;
        // Any reply other than the exact FINANCIAL token is non-financial.
        Ok(reply.trim() == "FINANCIAL")
    }
}
