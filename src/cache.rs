//! Keyed cache of prior model responses.
//!
//! The key is a stable SHA-256 hash of the canonicalized `(model, messages)`
//! pair, matching the original Python backend's `council:response:<hash>`
//! scheme. The backing store is a trait so a networked key-value store can
//! satisfy the same contract as the in-process map provided here.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model_client::ChatMessage;

/// Compute the canonical cache key for a `(model, messages)` pair.
///
/// Canonicalization mirrors `json.dumps({...}, sort_keys=True,
/// separators=(",", ":"))`: object keys sorted, no extraneous whitespace.
pub fn cache_key(model_id: &str, messages: &[ChatMessage]) -> String {
    #[derive(Serialize)]
    struct Canonical<'a> {
        messages: &'a [ChatMessage],
        model: &'a str,
    }
    let canonical = Canonical {
        messages,
        model: model_id,
    };
    let json = serde_json::to_string(&canonical).expect("ChatMessage always serializes");
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("council:response:{:x}", hasher.finalize())
}

/// Aggregate hit/miss/save counters plus a backend tag, as `Stats()` must
/// return.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub saves: u64,
    pub hit_rate_percent: f64,
    pub backend: &'static str,
}

/// Backing-store contract a response cache obeys, whether in-process or a
/// remote networked key-value store.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get_raw(&self, key: &str) -> Option<String>;
    async fn set_raw(&self, key: &str, value: String, ttl: Duration);
    async fn sweep_expired(&self);
    fn backend_tag(&self) -> &'static str;
}

struct Entry {
    value: String,
    expiry: Instant,
}

/// In-process map backend. Guarded by a single [`Mutex`] since the contract
/// is explicitly "not transactional; last-writer-wins" rather than
/// per-key locking.
#[derive(Default)]
pub struct InMemoryCacheBackend {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get_raw(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        match entries.get(key) {
            Some(entry) if entry.expiry > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Duration) {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expiry: Instant::now() + ttl,
            },
        );
    }

    async fn sweep_expired(&self) {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        let now = Instant::now();
        entries.retain(|_, entry| entry.expiry > now);
    }

    fn backend_tag(&self) -> &'static str {
        "memory"
    }
}

/// Cache for LLM responses, keyed by `(model, messages)`.
pub struct ResponseCache {
    backend: Box<dyn CacheBackend>,
    ttl: Duration,
    hits: Mutex<u64>,
    misses: Mutex<u64>,
    saves: Mutex<u64>,
}

impl ResponseCache {
    pub fn new(backend: Box<dyn CacheBackend>, ttl: Duration) -> Self {
        ResponseCache {
            backend,
            ttl,
            hits: Mutex::new(0),
            misses: Mutex::new(0),
            saves: Mutex::new(0),
        }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Box::new(InMemoryCacheBackend::new()), ttl)
    }

    /// Look up a cached response for `(model, messages)`. Stored as a raw
    /// JSON string so callers can cache arbitrary serializable payloads,
    /// including the synthetic "complete result" bundle used by the
    /// query-result cache.
    pub async fn get(&self, model_id: &str, messages: &[ChatMessage]) -> Option<String> {
        let key = cache_key(model_id, messages);
        match self.backend.get_raw(&key).await {
            Some(value) => {
                *self.hits.lock().expect("cache mutex poisoned") += 1;
                log::debug!("cache hit for {model_id}");
                Some(value)
            }
            None => {
                *self.misses.lock().expect("cache mutex poisoned") += 1;
                log::debug!("cache miss for {model_id}");
                None
            }
        }
    }

    pub async fn set(&self, model_id: &str, messages: &[ChatMessage], value: String) {
        let key = cache_key(model_id, messages);
        self.backend.set_raw(&key, value, self.ttl).await;
        *self.saves.lock().expect("cache mutex poisoned") += 1;
    }

    pub async fn sweep_expired(&self) {
        self.backend.sweep_expired().await;
    }

    pub fn stats(&self) -> CacheStats {
        let hits = *self.hits.lock().expect("cache mutex poisoned");
        let misses = *self.misses.lock().expect("cache mutex poisoned");
        let saves = *self.saves.lock().expect("cache mutex poisoned");
        let total = hits + misses;
        let hit_rate_percent = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        CacheStats {
            hits,
            misses,
            saves,
            hit_rate_percent,
            backend: self.backend.backend_tag(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages() -> Vec<ChatMessage> {
        vec![ChatMessage::user("hello")]
    }

    #[test]
    fn cache_key_is_deterministic() {
        let a = cache_key("gpt-4", &messages());
        let b = cache_key("gpt-4", &messages());
        assert_eq!(a, b);
        assert!(a.starts_with("council:response:"));
    }

    #[test]
    fn cache_key_distinguishes_models() {
        let a = cache_key("gpt-4", &messages());
        let b = cache_key("gpt-4o", &messages());
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn set_then_get_within_ttl_hits() {
        let cache = ResponseCache::in_memory(Duration::from_secs(60));
        cache.set("gpt-4", &messages(), "cached body".to_string()).await;
        let hit = cache.get("gpt-4", &messages()).await;
        assert_eq!(hit.as_deref(), Some("cached body"));
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn expired_entry_is_absent_and_removed() {
        let cache = ResponseCache::in_memory(Duration::from_millis(10));
        cache.set("gpt-4", &messages(), "cached body".to_string()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let hit = cache.get("gpt-4", &messages()).await;
        assert!(hit.is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn stats_report_hit_rate_and_backend() {
        let cache = ResponseCache::in_memory(Duration::from_secs(60));
        cache.get("gpt-4", &messages()).await;
        cache.set("gpt-4", &messages(), "x".to_string()).await;
        cache.get("gpt-4", &messages()).await;
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.backend, "memory");
        assert!((stats.hit_rate_percent - 50.0).abs() < f64::EPSILON);
    }
}
