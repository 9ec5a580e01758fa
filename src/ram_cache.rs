//! RAM Cache Module
//!
//! Provides the byte-bounded in-memory LRU cache that serves fast-path responses
//! without a backend round trip. Nothing here touches the network or the disk.
//!
//! Entries live in a slab of slots; recency is a doubly linked list threaded
//! through the slots by index, so the cache owns every entry and links are
//! plain positions rather than references. Lookup, promotion, insertion and
//! eviction are all O(1).

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// One resident entry plus its recency links
#[derive(Debug)]
struct Slot {
    key: String,
    payload: Bytes,
    /// Neighbour closer to the most-recently-used end
    newer: Option<usize>,
    /// Neighbour closer to the least-recently-used end
    older: Option<usize>,
}

/// RAM cache with strict least-recently-used eviction
#[derive(Debug)]
pub struct RamCache {
    enabled: bool,
    /// Entries must be strictly smaller than this
    max_entry_size: u64,
    /// Sum of resident payload sizes never exceeds this
    max_total_size: u64,
    current_size: u64,
    index: HashMap<String, usize>,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    /// Most recently used
    head: Option<usize>,
    /// Least recently used
    tail: Option<usize>,
    hit_count: u64,
    miss_count: u64,
    eviction_count: u64,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, PartialEq)]
pub struct RamCacheStats {
    pub enabled: bool,
    pub current_size: u64,
    pub max_size: u64,
    pub entries_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f32,
    pub eviction_count: u64,
}

impl RamCache {
    /// Create a cache holding at most `max_total_size` bytes in entries smaller
    /// than `max_entry_size`
    pub fn new(enabled: bool, max_entry_size: u64, max_total_size: u64) -> Self {
        Self {
            enabled,
            max_entry_size,
            max_total_size,
            current_size: 0,
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            hit_count: 0,
            miss_count: 0,
            eviction_count: 0,
        }
    }

    /// Create a cache that never stores anything
    pub fn disabled() -> Self {
        Self::new(false, 0, 0)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_entry_size(&self) -> u64 {
        self.max_entry_size
    }

    /// Check if a key is resident without touching recency
    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Look up an entry, promoting it to most-recently-used on a hit
    pub fn get(&mut self, key: &str) -> Option<Bytes> {
        let Some(&idx) = self.index.get(key) else {
            self.miss_count += 1;
            return None;
        };

        self.unlink(idx);
        self.push_front(idx);
        self.hit_count += 1;

        let payload = self.slots[idx].as_ref().map(|slot| slot.payload.clone());
        debug!("RAM cache hit for key: {}", key);
        payload
    }

    /// Store an entry as most-recently-used, evicting from the LRU end until it fits.
    ///
    /// Returns whether the entry was stored. Nothing changes when the cache is
    /// disabled or the payload is at or above the per-entry limit.
    pub fn put(&mut self, key: &str, payload: Bytes) -> bool {
        let size = payload.len() as u64;
        if !self.enabled || size >= self.max_entry_size {
            debug!(
                "Not caching {} ({} bytes, enabled={}, max_entry_size={})",
                key, size, self.enabled, self.max_entry_size
            );
            return false;
        }

        self.delete(key);

        if size > self.max_total_size {
            return false;
        }
        while self.current_size + size > self.max_total_size {
            if !self.evict_lru() {
                break;
            }
        }

        let slot = Slot {
            key: key.to_string(),
            payload,
            newer: None,
            older: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };

        self.push_front(idx);
        self.index.insert(key.to_string(), idx);
        self.current_size += size;

        debug!(
            "Stored entry in RAM cache: {} ({} bytes, total {} / {})",
            key, size, self.current_size, self.max_total_size
        );
        true
    }

    /// Remove an entry, returning whether it existed
    pub fn delete(&mut self, key: &str) -> bool {
        match self.index.remove(key) {
            Some(idx) => {
                self.release(idx);
                true
            }
            None => false,
        }
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.current_size = 0;
        info!("Cleared all entries from RAM cache");
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Total bytes currently resident
    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    /// Keys from most to least recently used
    pub fn keys_by_recency(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.index.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let Some(slot) = self.slots[idx].as_ref() else {
                break;
            };
            keys.push(slot.key.clone());
            cursor = slot.older;
        }
        keys
    }

    pub fn get_stats(&self) -> RamCacheStats {
        let total_requests = self.hit_count + self.miss_count;
        let hit_rate = if total_requests > 0 {
            self.hit_count as f32 / total_requests as f32
        } else {
            0.0
        };

        RamCacheStats {
            enabled: self.enabled,
            current_size: self.current_size,
            max_size: self.max_total_size,
            entries_count: self.index.len() as u64,
            hit_count: self.hit_count,
            miss_count: self.miss_count,
            hit_rate,
            eviction_count: self.eviction_count,
        }
    }

    /// Evict the least-recently-used entry; false when empty
    fn evict_lru(&mut self) -> bool {
        let Some(idx) = self.tail else {
            return false;
        };
        if let Some(slot) = self.slots[idx].as_ref() {
            let key = slot.key.clone();
            debug!("Evicting LRU entry: {} ({} bytes)", key, slot.payload.len());
            self.index.remove(&key);
        }
        self.release(idx);
        self.eviction_count += 1;
        true
    }

    /// Unlink a slot, free it and subtract its size
    fn release(&mut self, idx: usize) {
        self.unlink(idx);
        if let Some(slot) = self.slots[idx].take() {
            self.current_size = self.current_size.saturating_sub(slot.payload.len() as u64);
        }
        self.free.push(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (newer, older) = match self.slots[idx].as_ref() {
            Some(slot) => (slot.newer, slot.older),
            None => return,
        };

        match newer {
            Some(n) => {
                if let Some(slot) = self.slots[n].as_mut() {
                    slot.older = older;
                }
            }
            None => self.head = older,
        }
        match older {
            Some(o) => {
                if let Some(slot) = self.slots[o].as_mut() {
                    slot.newer = newer;
                }
            }
            None => self.tail = newer,
        }

        if let Some(slot) = self.slots[idx].as_mut() {
            slot.newer = None;
            slot.older = None;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.newer = None;
            slot.older = old_head;
        }
        if let Some(h) = old_head {
            if let Some(slot) = self.slots[h].as_mut() {
                slot.newer = Some(idx);
            }
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }
}

/// RAM cache shared between request handlers and upload tasks
///
/// Each method takes the lock for exactly one cache operation, so eviction
/// followed by insertion is never interleaved with another writer. The lock is
/// never held across an `.await`.
#[derive(Debug, Clone)]
pub struct SharedRamCache {
    inner: Arc<Mutex<RamCache>>,
}

impl SharedRamCache {
    pub fn new(cache: RamCache) -> Self {
        Self {
            inner: Arc::new(Mutex::new(cache)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.lock().get(key)
    }

    pub fn put(&self, key: &str, payload: Bytes) -> bool {
        self.lock().put(key, payload)
    }

    pub fn delete(&self, key: &str) -> bool {
        self.lock().delete(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    /// Largest payload worth buffering for this cache, 0 when disabled
    pub fn entry_limit(&self) -> u64 {
        let cache = self.lock();
        if cache.is_enabled() {
            cache.max_entry_size()
        } else {
            0
        }
    }

    pub fn get_stats(&self) -> RamCacheStats {
        self.lock().get_stats()
    }

    pub fn lock(&self) -> MutexGuard<'_, RamCache> {
        // Every operation leaves the cache consistent before it can panic.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_of(len: usize) -> Bytes {
        Bytes::from(vec![7u8; len])
    }

    #[test]
    fn test_put_then_get_returns_payload() {
        let mut cache = RamCache::new(true, 100, 1000);
        assert!(cache.put("ac/1", Bytes::from_static(b"hello")));
        assert_eq!(cache.get("ac/1"), Some(Bytes::from_static(b"hello")));
        assert!(cache.contains("ac/1"));
        assert_eq!(cache.current_size(), 5);
    }

    #[test]
    fn test_miss_has_no_side_effects() {
        let mut cache = RamCache::new(true, 100, 1000);
        cache.put("a", bytes_of(10));
        assert_eq!(cache.get("missing"), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.keys_by_recency(), vec!["a".to_string()]);
    }

    #[test]
    fn test_entry_at_max_entry_size_is_rejected() {
        let mut cache = RamCache::new(true, 10, 1000);
        assert!(!cache.put("big", bytes_of(10)));
        assert!(cache.put("small", bytes_of(9)));
        assert!(!cache.contains("big"));
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let mut cache = RamCache::disabled();
        assert!(!cache.put("a", bytes_of(1)));
        assert_eq!(cache.get("a"), None);
        assert!(!cache.is_enabled());
    }

    #[test]
    fn test_overwrite_replaces_size_accounting() {
        let mut cache = RamCache::new(true, 100, 1000);
        cache.put("a", bytes_of(50));
        cache.put("a", bytes_of(20));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_size(), 20);
    }

    #[test]
    fn test_evicts_least_recently_used_first() {
        let mut cache = RamCache::new(true, 50, 100);
        cache.put("a", bytes_of(40));
        cache.put("b", bytes_of(40));
        cache.put("c", bytes_of(40));

        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.get_stats().eviction_count, 1);
    }

    #[test]
    fn test_get_promotes_entry() {
        let mut cache = RamCache::new(true, 50, 100);
        cache.put("a", bytes_of(40));
        cache.put("b", bytes_of(40));
        cache.get("a");
        cache.put("c", bytes_of(40));

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert_eq!(
            cache.keys_by_recency(),
            vec!["c".to_string(), "a".to_string()]
        );
    }

    #[test]
    fn test_delete_reports_presence() {
        let mut cache = RamCache::new(true, 50, 100);
        cache.put("a", bytes_of(10));
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.current_size(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_slots_are_reused_after_delete() {
        let mut cache = RamCache::new(true, 50, 100);
        cache.put("a", bytes_of(10));
        cache.put("b", bytes_of(10));
        cache.delete("a");
        cache.put("c", bytes_of(10));
        assert_eq!(cache.slots.len(), 2);
        assert_eq!(
            cache.keys_by_recency(),
            vec!["c".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut cache = RamCache::new(true, 50, 100);
        cache.put("a", bytes_of(10));
        cache.put("b", bytes_of(10));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.current_size(), 0);
        assert!(cache.keys_by_recency().is_empty());
    }

    #[test]
    fn test_shared_handle_sees_same_entries() {
        let shared = SharedRamCache::new(RamCache::new(true, 50, 100));
        let other = shared.clone();
        assert!(shared.put("a", bytes_of(10)));
        assert_eq!(other.get("a"), Some(bytes_of(10)));
        assert_eq!(other.entry_limit(), 50);
        assert_eq!(SharedRamCache::new(RamCache::disabled()).entry_limit(), 0);
    }

    #[test]
    fn test_hit_rate_statistics() {
        let mut cache = RamCache::new(true, 50, 100);
        cache.put("a", bytes_of(10));
        cache.get("a");
        cache.get("b");
        let stats = cache.get_stats();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
        assert!((stats.hit_rate - 0.5).abs() < f32::EPSILON);
    }
}
