//! Capacity- and time-bounded cache for populated prompt text and cached
//! opening lines. Injected rather than ambient so tests can substitute the
//! no-op implementation; `invalidate` is the entry point to call whenever
//! the underlying profile data changes.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub trait PromptCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: String);
    fn invalidate(&self, key: &str);
}

pub fn opening_line_key(agent_template: &str) -> String {
    format!("opening_line:{agent_template}")
}

pub fn system_prompt_key(user_id: &str) -> String {
    format!("system_prompt:{user_id}")
}

struct CacheEntry {
    value: String,
    stored_at: Instant,
}

pub struct LruPromptCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
}

impl LruPromptCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }
}

impl PromptCache for LruPromptCache {
    fn get(&self, key: &str) -> Option<String> {
        let Ok(mut entries) = self.entries.lock() else {
            return None;
        };
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: &str, value: String) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(
                key.to_string(),
                CacheEntry {
                    value,
                    stored_at: Instant::now(),
                },
            );
        }
    }

    fn invalidate(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.pop(key);
        }
    }
}

/// Cache that remembers nothing. Used by tests and one-shot tools.
pub struct NoopPromptCache;

impl PromptCache for NoopPromptCache {
    fn get(&self, _key: &str) -> Option<String> {
        None
    }

    fn put(&self, _key: &str, _value: String) {}

    fn invalidate(&self, _key: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_returns_values() {
        let cache = LruPromptCache::new(4, Duration::from_secs(60));
        cache.put("k", "v".to_string());
        assert_eq!(cache.get("k"), Some("v".to_string()));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache = LruPromptCache::new(4, Duration::from_millis(0));
        cache.put("k", "v".to_string());
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = LruPromptCache::new(2, Duration::from_secs(60));
        cache.put("a", "1".to_string());
        cache.put("b", "2".to_string());
        cache.get("a");
        cache.put("c", "3".to_string());
        assert_eq!(cache.get("a"), Some("1".to_string()));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = LruPromptCache::new(4, Duration::from_secs(60));
        let key = opening_line_key("general");
        cache.put(&key, "Welcome!".to_string());
        cache.invalidate(&key);
        assert_eq!(cache.get(&key), None);
    }

    #[test]
    fn noop_cache_never_remembers() {
        let cache = NoopPromptCache;
        cache.put("k", "v".to_string());
        assert_eq!(cache.get("k"), None);
    }
}
