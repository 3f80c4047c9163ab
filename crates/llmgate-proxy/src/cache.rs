//! Fingerprint-keyed response cache.
//!
//! Entries are keyed by a SHA-256 digest of `(provider, path, canonical
//! body)` and expire after the configured TTL. Expired entries are evicted
//! lazily on access and by the hourly background sweep. Hop-by-hop and
//! framing headers are filtered out on insertion so a replayed response
//! never carries stale transfer metadata.

use axum::http::HeaderMap;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use llmgate_core::{Clock, Provider};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Headers never stored or replayed from cache.
const FILTERED_HEADERS: &[&str] = &[
    "transfer-encoding",
    "content-length",
    "connection",
    "keep-alive",
    "content-encoding",
];

/// A cached upstream response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub inserted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Hit/miss counters and size.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub total_requests: u64,
    pub hit_rate: f64,
}

/// In-process response cache with TTL expiry.
pub struct ResponseCache {
    entries: DashMap<String, CachedResponse>,
    hits: AtomicU64,
    misses: AtomicU64,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl ResponseCache {
    pub fn new(ttl_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            ttl: Duration::seconds(ttl_secs as i64),
            clock,
        }
    }

    /// Cache key for a request.
    ///
    /// The body's canonical serialisation is key-ordered (`serde_json::Map`
    /// sorts keys), so semantically equal bodies share a fingerprint.
    pub fn fingerprint(provider: Provider, path: &str, body: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(provider.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(path.as_bytes());
        hasher.update(b"\n");
        hasher.update(body.to_string().as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Look up an unexpired entry, counting the hit or miss.
    pub fn get(&self, fingerprint: &str) -> Option<CachedResponse> {
        let now = self.clock.now();
        if let Some(entry) = self.entries.get(fingerprint) {
            if now < entry.expires_at {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.clone());
            }
            drop(entry);
            self.entries.remove(fingerprint);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store or replace an entry with the configured TTL.
    pub fn put(&self, fingerprint: String, status: u16, headers: &HeaderMap, body: Bytes) {
        let now = self.clock.now();
        self.entries.insert(
            fingerprint,
            CachedResponse {
                status,
                headers: filter_headers(headers),
                body,
                inserted_at: now,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Remove expired entries. Returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.expires_at);
        before - self.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            size: self.entries.len(),
            total_requests: total,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

/// Copy headers, dropping framing and hop-by-hop ones.
pub fn filter_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !FILTERED_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use llmgate_core::ManualClock;
    use serde_json::json;

    fn make_cache(ttl_secs: u64) -> (Arc<ManualClock>, ResponseCache) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = ResponseCache::new(ttl_secs, clock.clone());
        (clock, cache)
    }

    fn plain_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers
    }

    #[test]
    fn test_put_get_round_trip() {
        let (_clock, cache) = make_cache(300);
        let fp = "abc".to_string();
        cache.put(fp.clone(), 200, &plain_headers(), Bytes::from_static(b"{}"));

        let entry = cache.get(&fp).expect("entry should be present");
        assert_eq!(entry.status, 200);
        assert_eq!(entry.body, Bytes::from_static(b"{}"));
    }

    #[test]
    fn test_entry_expires_at_ttl_boundary() {
        let (clock, cache) = make_cache(300);
        cache.put("fp".to_string(), 200, &plain_headers(), Bytes::new());

        clock.advance(Duration::seconds(299));
        assert!(cache.get("fp").is_some());

        // now == expires_at is no longer served
        clock.advance(Duration::seconds(1));
        assert!(cache.get("fp").is_none());
    }

    #[test]
    fn test_expired_entry_is_lazily_evicted() {
        let (clock, cache) = make_cache(10);
        cache.put("fp".to_string(), 200, &plain_headers(), Bytes::new());
        clock.advance(Duration::seconds(11));

        assert!(cache.get("fp").is_none());
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_hit_rate_identity() {
        let (_clock, cache) = make_cache(300);
        cache.put("a".to_string(), 200, &plain_headers(), Bytes::new());

        let _ = cache.get("a"); // hit
        let _ = cache.get("b"); // miss
        let _ = cache.get("a"); // hit

        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, stats.total_requests);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_cache_hit_rate_is_zero() {
        let (_clock, cache) = make_cache(300);
        assert_eq!(cache.stats().hit_rate, 0.0);
    }

    #[test]
    fn test_fingerprint_is_stable_and_discriminating() {
        let body = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});
        let a = ResponseCache::fingerprint(Provider::OpenAi, "/v1/chat/completions", &body);
        let b = ResponseCache::fingerprint(Provider::OpenAi, "/v1/chat/completions", &body);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // 256-bit hex

        let c = ResponseCache::fingerprint(Provider::Anthropic, "/v1/chat/completions", &body);
        assert_ne!(a, c);
        let d = ResponseCache::fingerprint(Provider::OpenAi, "/v1/other", &body);
        assert_ne!(a, d);
        let e = ResponseCache::fingerprint(
            Provider::OpenAi,
            "/v1/chat/completions",
            &json!({"model": "m2"}),
        );
        assert_ne!(a, e);
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"a": 1, "b": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap();
        assert_eq!(
            ResponseCache::fingerprint(Provider::OpenAi, "/p", &a),
            ResponseCache::fingerprint(Provider::OpenAi, "/p", &b),
        );
    }

    #[test]
    fn test_filter_headers_drops_framing() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("content-length", HeaderValue::from_static("42"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("content-encoding", HeaderValue::from_static("gzip"));
        headers.insert("x-request-id", HeaderValue::from_static("r1"));

        let filtered = filter_headers(&headers);
        let names: Vec<&str> = filtered.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"content-type"));
        assert!(names.contains(&"x-request-id"));
        assert!(!names.contains(&"content-length"));
        assert!(!names.contains(&"transfer-encoding"));
        assert!(!names.contains(&"connection"));
        assert!(!names.contains(&"content-encoding"));
    }

    #[test]
    fn test_evict_expired_sweep() {
        let (clock, cache) = make_cache(10);
        cache.put("a".to_string(), 200, &plain_headers(), Bytes::new());
        cache.put("b".to_string(), 200, &plain_headers(), Bytes::new());
        clock.advance(Duration::seconds(5));
        cache.put("c".to_string(), 200, &plain_headers(), Bytes::new());

        clock.advance(Duration::seconds(6)); // a, b expired; c alive
        assert_eq!(cache.evict_expired(), 2);
        assert_eq!(cache.stats().size, 1);
    }

    #[test]
    fn test_put_replaces_existing_entry() {
        let (_clock, cache) = make_cache(300);
        cache.put("fp".to_string(), 200, &plain_headers(), Bytes::from_static(b"v1"));
        cache.put("fp".to_string(), 200, &plain_headers(), Bytes::from_static(b"v2"));

        let entry = cache.get("fp").unwrap();
        assert_eq!(entry.body, Bytes::from_static(b"v2"));
        assert_eq!(cache.stats().size, 1);
    }
}
