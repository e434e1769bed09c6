use lru::LruCache;
use nostr::Timestamp;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Bounded set of first-seen keys with least-recently-used eviction.
///
/// Check and insert happen under one lock so that two relays racing to deliver
/// the same event cannot both win.
#[derive(Debug)]
pub struct DedupIndex {
    seen: Mutex<LruCache<String, Timestamp>>,
}

impl DedupIndex {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns true if `key` has been seen. A hit refreshes its recency.
    pub fn contains(&self, key: &str) -> bool {
        self.seen.lock().get(key).is_some()
    }

    /// Records `key` as seen now. Returns false if it was already present.
    pub fn insert(&self, key: String) -> bool {
        let mut seen = self.seen.lock();
        if seen.get(&key).is_some() {
            return false;
        }
        seen.put(key, Timestamp::now());
        true
    }

    /// When `key` was first recorded.
    pub fn first_seen(&self, key: &str) -> Option<Timestamp> {
        self.seen.lock().peek(key).copied()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}
