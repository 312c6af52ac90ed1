//! LRU cache of validated API keys.
//!
//! Keeps the Argon2 verification cost off the hot path. Entries carry a
//! TTL and are evicted lazily on access; capacity is enforced by tail
//! eviction on insert.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::domain::ApiKey;

struct CachedKey {
    key: ApiKey,
    cached_at: Instant,
}

pub struct ApiKeyCache {
    entries: Mutex<LruCache<String, CachedKey>>,
    ttl: Duration,
}

impl ApiKeyCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Look up a key by id. Expired entries are dropped and report a miss.
    pub fn get(&self, key_id: &str) -> Option<ApiKey> {
        let mut entries = self.entries.lock().expect("api key cache lock poisoned");
        match entries.get(key_id) {
            Some(entry) if entry.cached_at.elapsed() < self.ttl => Some(entry.key.clone()),
            Some(_) => {
                entries.pop(key_id);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: &ApiKey) {
        let mut entries = self.entries.lock().expect("api key cache lock poisoned");
        entries.put(
            key.id.clone(),
            CachedKey {
                key: key.clone(),
                cached_at: Instant::now(),
            },
        );
    }

    /// Drop a single entry, e.g. after any mutation of the stored key.
    pub fn delete(&self, key_id: &str) {
        self.entries
            .lock()
            .expect("api key cache lock poisoned")
            .pop(key_id);
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("api key cache lock poisoned")
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("api key cache lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
