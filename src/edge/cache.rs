use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

/// How long a models listing stays fresh.
pub const MODELS_CACHE_TTL: Duration = Duration::from_secs(60);

struct CachedModels {
    payload: Value,
    expires_at: Instant,
}

/// Single-slot cache for the `/v1/models` payload. One entry per edge
/// process; no per-worker partitioning.
pub struct ModelsCache {
    entry: Mutex<Option<CachedModels>>,
    ttl: Duration,
}

impl ModelsCache {
    pub fn new() -> Self {
        Self::with_ttl(MODELS_CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entry: Mutex::new(None),
            ttl,
        }
    }

    /// The cached payload, if still fresh.
    pub fn get(&self) -> Option<Value> {
        let entry = self.entry.lock().unwrap();
        entry
            .as_ref()
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.payload.clone())
    }

    pub fn fill(&self, payload: Value) {
        *self.entry.lock().unwrap() = Some(CachedModels {
            payload,
            expires_at: Instant::now() + self.ttl,
        });
    }
}

impl Default for ModelsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_cache_misses() {
        let cache = ModelsCache::new();
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_fresh_entry_hits() {
        let cache = ModelsCache::new();
        cache.fill(json!({"object": "list", "data": []}));
        assert_eq!(cache.get().unwrap(), json!({"object": "list", "data": []}));
    }

    #[test]
    fn test_stale_entry_misses() {
        let cache = ModelsCache::with_ttl(Duration::from_millis(0));
        cache.fill(json!({"object": "list"}));
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_fill_replaces() {
        let cache = ModelsCache::new();
        cache.fill(json!({"v": 1}));
        cache.fill(json!({"v": 2}));
        assert_eq!(cache.get().unwrap(), json!({"v": 2}));
    }
}
