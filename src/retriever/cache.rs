//! Best-effort TTL cache for retrieve responses
//!
//! Keyed by `{namespace, session_id, max_memories, trimmed input}`. Misses
//! race freely; a duplicate fetch is acceptable. Eviction is approximate:
//! when full, the oldest entry goes.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::types::RetrieveResponse;

pub struct RetrieveCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
}

struct CacheEntry {
    response: RetrieveResponse,
    created_at: Instant,
}

impl RetrieveCache {
    /// `ttl_secs == 0` disables the cache entirely
    pub fn new(ttl_secs: u64, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_secs(ttl_secs),
            max_entries: max_entries.max(1),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    pub fn cache_key(
        namespace: &str,
        session_id: &str,
        max_memories: usize,
        user_input: &str,
    ) -> String {
        format!(
            "{}::{}::{}::{}",
            namespace,
            session_id,
            max_memories,
            user_input.trim()
        )
    }

    pub fn get(&self, key: &str) -> Option<RetrieveResponse> {
        if !self.enabled() {
            return None;
        }
        let hit = self.entries.get(key)?;
        if hit.created_at.elapsed() > self.ttl {
            drop(hit);
            self.entries.remove(key);
            return None;
        }
        Some(hit.response.clone())
    }

    pub fn put(&self, key: String, response: RetrieveResponse) {
        if !self.enabled() {
            return;
        }
        if self.entries.len() >= self.max_entries {
            // Approximate eviction: drop the oldest entry.
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.value().created_at)
                .map(|e| e.key().clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                response,
                created_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(context: &str) -> RetrieveResponse {
        RetrieveResponse {
            context: context.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_disabled_cache_never_hits() {
        let cache = RetrieveCache::new(0, 10);
        cache.put("k".into(), response("c"));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_hit_and_key_trimming() {
        let cache = RetrieveCache::new(60, 10);
        let key = RetrieveCache::cache_key("ns", "s1", 5, "  hello  ");
        cache.put(key.clone(), response("ctx"));
        assert_eq!(cache.get(&key).unwrap().context, "ctx");
        assert_eq!(key, RetrieveCache::cache_key("ns", "s1", 5, "hello"));
    }

    #[test]
    fn test_eviction_bounds_size() {
        let cache = RetrieveCache::new(60, 3);
        for i in 0..10 {
            cache.put(format!("k{}", i), response("c"));
        }
        assert!(cache.len() <= 3);
    }
}
