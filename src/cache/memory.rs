//! Size-bounded LRU cache of decoded images.

use std::sync::Mutex;

use lru::LruCache;
use tracing::{debug, trace};

use crate::events::{DecodedImage, RequestKey};

/// Result of offering an image to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Inserted,
    /// An entry for the key already exists; the first writer wins.
    AlreadyCached,
    /// The image alone is bigger than the whole budget.
    TooLarge,
}

struct Entries {
    lru: LruCache<RequestKey, DecodedImage>,
    used: u64,
}

/// Maps request keys to decoded images under a fixed byte budget.
///
/// Every call is one critical section, so recency updates, inserts and evictions never
/// interleave between workers.
pub struct MemoryCache {
    capacity: u64,
    entries: Mutex<Entries>,
}

impl MemoryCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            entries: Mutex::new(Entries {
                lru: LruCache::unbounded(),
                used: 0,
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes currently accounted to cached images.
    pub fn used(&self) -> u64 {
        self.lock().used
    }

    pub fn len(&self) -> usize {
        self.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up `key`; a hit refreshes its recency.
    pub fn get(&self, key: &RequestKey) -> Option<DecodedImage> {
        self.lock().lru.get(key).cloned()
    }

    /// Presence check that leaves recency untouched.
    pub fn contains(&self, key: &RequestKey) -> bool {
        self.lock().lru.contains(key)
    }

    pub fn put(&self, key: RequestKey, image: DecodedImage) -> Admission {
        let size = image.byte_size();
        let mut entries = self.lock();
        if entries.lru.contains(&key) {
            trace!(%key, "memory cache: keeping existing entry");
            return Admission::AlreadyCached;
        }
        if size > self.capacity {
            debug!(%key, size, capacity = self.capacity, "memory cache: image exceeds capacity");
            return Admission::TooLarge;
        }
        while entries.used + size > self.capacity {
            match entries.lru.pop_lru() {
                Some((evicted, old)) => {
                    entries.used -= old.byte_size();
                    debug!(key = %evicted, size = old.byte_size(), "memory cache: evicted");
                }
                None => break,
            }
        }
        entries.used += size;
        entries.lru.put(key, image);
        Admission::Inserted
    }

    pub fn remove(&self, key: &RequestKey) -> Option<DecodedImage> {
        let mut entries = self.lock();
        let image = entries.lru.pop(key)?;
        entries.used -= image.byte_size();
        Some(image)
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.lru.clear();
        entries.used = 0;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        self.entries.lock().expect("memory cache poisoned")
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.lock();
        f.debug_struct("MemoryCache")
            .field("capacity", &self.capacity)
            .field("used", &entries.used)
            .field("len", &entries.lru.len())
            .finish()
    }
}
