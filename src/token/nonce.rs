//! Replay-protection nonce cache.
//!
//! Bounded LRU with TTL under a single mutex, so membership check and
//! insert are one atomic step. There is no timer sweep: expired entries
//! are reclaimed lazily from the LRU tail during inserts, or overwritten
//! in place when re-presented.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

#[derive(Debug, Clone, Copy)]
struct NonceEntry {
    created_at: Instant,
}

pub struct NonceCache {
    entries: Mutex<LruCache<String, NonceEntry>>,
    ttl: Duration,
}

impl NonceCache {
    /// Default capacity of 100k nonces with a 60s TTL.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Atomically insert `nonce` if absent (or present but expired).
    ///
    /// Returns `false` when a live entry already exists — the replay
    /// case. A live hit is promoted to the front, which under the single
    /// mutex is a write operation like any other.
    pub fn add_if_absent(&self, nonce: &str) -> bool {
        let mut entries = self.entries.lock().expect("nonce cache lock poisoned");

        // Reclaim expired entries from the tail before inserting.
        while let Some((_, entry)) = entries.peek_lru() {
            if entry.created_at.elapsed() < self.ttl {
                break;
            }
            entries.pop_lru();
        }

        if let Some(entry) = entries.get_mut(nonce) {
            if entry.created_at.elapsed() < self.ttl {
                return false;
            }
            // Expired under the same key: replace in place.
            entry.created_at = Instant::now();
            return true;
        }

        entries.put(
            nonce.to_owned(),
            NonceEntry {
                created_at: Instant::now(),
            },
        );
        true
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("nonce cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("nonce cache lock poisoned")
            .clear();
    }
}
