//! Per-client token-bucket rate limiting.
//!
//! Each client identity owns an isolated bucket in a concurrent map.
//! Buckets are created lazily at full capacity and refilled in whole
//! refill-interval steps, so refill behaviour under steady low traffic is
//! deterministic and test-observable. A periodic sweep removes buckets
//! idle for a day; it never runs on the request path.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use llmgate_core::{Clock, RateLimitConfig};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Buckets untouched for this long are dropped by [`RateLimiter::sweep`].
const IDLE_BUCKET_LIFETIME_HOURS: i64 = 24;

/// State for a single client identity.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

/// Read-only projection of one bucket.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub remaining: f64,
    /// When the next refill step lands.
    pub reset_at: DateTime<Utc>,
    pub max_tokens: f64,
}

/// Aggregate limiter state for the dashboard and snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub active_buckets: usize,
    pub max_tokens: f64,
    pub refill_rate: f64,
    pub refill_interval_ms: u64,
}

/// Token-bucket rate limiter keyed by client identity.
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            buckets: DashMap::new(),
        }
    }

    /// Try to take `cost` tokens for `identity`.
    ///
    /// Refill advances in whole intervals before the take; the advance is
    /// kept even when the take fails, so `last_refill` never moves backwards.
    pub fn try_consume(&self, identity: &str, cost: f64) -> bool {
        let now = self.clock.now();
        let mut bucket = self
            .buckets
            .entry(identity.to_string())
            .or_insert_with(|| TokenBucket {
                tokens: self.config.max_tokens,
                last_refill: now,
            });

        let elapsed_ms = (now - bucket.last_refill).num_milliseconds().max(0) as u64;
        let intervals = if self.config.refill_interval_ms == 0 {
            0
        } else {
            elapsed_ms / self.config.refill_interval_ms
        };
        let add = intervals as f64 * self.config.refill_rate;
        if add > 0.0 {
            bucket.tokens = (bucket.tokens + add).min(self.config.max_tokens);
            bucket.last_refill = now;
        }

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            debug!(identity, cost, remaining = bucket.tokens, "Rate limit: allowed");
            true
        } else {
            debug!(identity, cost, remaining = bucket.tokens, "Rate limit: rejected");
            false
        }
    }

    /// Read-only bucket projection. Unknown identities report a full bucket.
    pub fn status(&self, identity: &str) -> RateLimitStatus {
        let now = self.clock.now();
        match self.buckets.get(identity) {
            Some(bucket) => {
                // Project the pending refill without writing it back.
                let elapsed_ms = (now - bucket.last_refill).num_milliseconds().max(0) as u64;
                let intervals = if self.config.refill_interval_ms == 0 {
                    0
                } else {
                    elapsed_ms / self.config.refill_interval_ms
                };
                let remaining = (bucket.tokens + intervals as f64 * self.config.refill_rate)
                    .min(self.config.max_tokens);
                RateLimitStatus {
                    remaining,
                    reset_at: bucket.last_refill
                        + Duration::milliseconds(
                            ((intervals + 1) * self.config.refill_interval_ms) as i64,
                        ),
                    max_tokens: self.config.max_tokens,
                }
            }
            None => RateLimitStatus {
                remaining: self.config.max_tokens,
                reset_at: now,
                max_tokens: self.config.max_tokens,
            },
        }
    }

    /// Remove the bucket for `identity`. Returns whether one existed.
    pub fn reset(&self, identity: &str) -> bool {
        self.buckets.remove(identity).is_some()
    }

    /// Drop buckets idle for more than a day. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let cutoff = self.clock.now() - Duration::hours(IDLE_BUCKET_LIFETIME_HOURS);
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.last_refill > cutoff);
        before - self.buckets.len()
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            active_buckets: self.buckets.len(),
            max_tokens: self.config.max_tokens,
            refill_rate: self.config.refill_rate,
            refill_interval_ms: self.config.refill_interval_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
