//! Fingerprinted response cache with single-flight deduplication
//!
//! Keys are SHA-256 fingerprints over the request content. Concurrent
//! misses for the same key collapse into one upstream call: the first
//! caller takes the flight lock, the rest wait and re-read the cache.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

struct CacheEntry {
    value: String,
    inserted_at: Instant,
}

/// TTL cache keyed by request fingerprint.
pub struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Fingerprint for a chat completion. Temperature and max_tokens are
    /// deliberately excluded from the key; widening it is a design-change
    /// signal, not a bug fix.
    pub fn completion_key(system_prompt: &str, user_prompt: &str, model: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(system_prompt.as_bytes());
        hasher.update(user_prompt.as_bytes());
        hasher.update(model.as_bytes());
        format!("llm:{:x}", hasher.finalize())
    }

    /// Fingerprint for an embedding lookup.
    pub fn embedding_key(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        format!("embed:{:x}", hasher.finalize())
    }

    /// Fresh cached value, if any. Expired entries are evicted on read.
    pub async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                debug!("Cache hit for {key}");
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn put(&self, key: &str, value: String) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Flight lock for a key. Callers must lock the returned mutex,
    /// re-check the cache, and call [`ResponseCache::end_flight`] when
    /// done.
    pub async fn begin_flight(&self, key: &str) -> Arc<Mutex<()>> {
        let mut in_flight = self.in_flight.lock().await;
        in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn end_flight(&self, key: &str) {
        let mut in_flight = self.in_flight.lock().await;
        in_flight.remove(key);
    }

    /// Number of live (possibly expired) entries, for diagnostics.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
