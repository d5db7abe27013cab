use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};

use crate::caching::ResourceKey;
use crate::config::MemoryCachePolicy;
use crate::types::Payload;

/// The in-memory cache tier.
///
/// Implementations only do bookkeeping, never I/O. Absence of a key is not a
/// statement about the resource, it merely forces a fetch.
pub trait MemoryCache: Send + Sync {
    /// Looks up a payload, with whatever recency bookkeeping the policy
    /// requires.
    fn get(&self, key: &ResourceKey) -> Option<Arc<Payload>>;

    /// Stores a payload under the given key.
    fn put(&self, key: ResourceKey, payload: Arc<Payload>);

    /// Drops the entry for the given key, if any.
    fn remove(&self, key: &ResourceKey);

    /// Drops all entries.
    fn clear(&self);

    /// The number of entries currently mapped, including entries the weak
    /// policy has not pruned yet.
    fn len(&self) -> usize;
}

/// Creates the memory cache tier selected by configuration.
pub(crate) fn from_policy(policy: MemoryCachePolicy, max_entries: usize) -> Arc<dyn MemoryCache> {
    match policy {
        MemoryCachePolicy::Lru => Arc::new(LruMemoryCache::new(max_entries)),
        MemoryCachePolicy::Weak => Arc::new(WeakMemoryCache::new()),
    }
}

#[derive(Debug, Default)]
struct LruInner {
    entries: HashMap<ResourceKey, (u64, Arc<Payload>)>,
    /// Recency order, oldest stamp first. Values mirror `entries` keys.
    order: BTreeMap<u64, ResourceKey>,
    next_stamp: u64,
}

impl LruInner {
    fn touch(&mut self, key: &ResourceKey) -> Option<Arc<Payload>> {
        let (stamp, payload) = self.entries.get_mut(key)?;
        let payload = Arc::clone(payload);
        self.order.remove(stamp);
        *stamp = self.next_stamp;
        self.order.insert(self.next_stamp, key.clone());
        self.next_stamp += 1;
        Some(payload)
    }
}

/// Strict least-recently-used retention with a fixed maximum entry count.
///
/// `get` promotes an entry to most-recently-used; `put` beyond capacity
/// evicts the least-recently-used entry first.
#[derive(Debug)]
pub struct LruMemoryCache {
    max_entries: usize,
    inner: Mutex<LruInner>,
}

impl LruMemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            // A zero capacity would turn `put` into a no-op loop.
            max_entries: max_entries.max(1),
            inner: Mutex::new(LruInner::default()),
        }
    }
}

impl MemoryCache for LruMemoryCache {
    fn get(&self, key: &ResourceKey) -> Option<Arc<Payload>> {
        self.inner.lock().unwrap().touch(key)
    }

    fn put(&self, key: ResourceKey, payload: Arc<Payload>) {
        let mut inner = self.inner.lock().unwrap();

        if let Some((stamp, _)) = inner.entries.remove(&key) {
            inner.order.remove(&stamp);
        }

        let stamp = inner.next_stamp;
        inner.next_stamp += 1;
        inner.order.insert(stamp, key.clone());
        inner.entries.insert(key, (stamp, payload));

        while inner.entries.len() > self.max_entries {
            let Some((_, oldest)) = inner.order.pop_first() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    fn remove(&self, key: &ResourceKey) {
        let mut inner = self.inner.lock().unwrap();
        if let Some((stamp, _)) = inner.entries.remove(key) {
            inner.order.remove(&stamp);
        }
    }

    fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.order.clear();
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

/// Reclaimable retention: payloads stay cached only while some consumer
/// still holds the `Arc`.
///
/// Entries whose payload has been dropped read as absent and are pruned on
/// lookup; the map itself is swept periodically so dead mappings do not
/// accumulate between lookups.
#[derive(Debug, Default)]
pub struct WeakMemoryCache {
    inner: Mutex<WeakInner>,
}

#[derive(Debug, Default)]
struct WeakInner {
    entries: HashMap<ResourceKey, Weak<Payload>>,
    sweep_at: usize,
}

impl WeakMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryCache for WeakMemoryCache {
    fn get(&self, key: &ResourceKey) -> Option<Arc<Payload>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get(key).and_then(Weak::upgrade) {
            Some(payload) => Some(payload),
            None => {
                inner.entries.remove(key);
                None
            }
        }
    }

    fn put(&self, key: ResourceKey, payload: Arc<Payload>) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(key, Arc::downgrade(&payload));

        if inner.entries.len() >= inner.sweep_at {
            inner.entries.retain(|_, weak| weak.strong_count() > 0);
            inner.sweep_at = (inner.entries.len() * 2).max(16);
        }
    }

    fn remove(&self, key: &ResourceKey) {
        self.inner.lock().unwrap().entries.remove(key);
    }

    fn clear(&self) {
        self.inner.lock().unwrap().entries.clear();
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn payload(body: &str) -> Arc<Payload> {
        Arc::new(Payload::from_body(Bytes::copy_from_slice(body.as_bytes())))
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::for_testing(name)
    }

    #[test]
    fn lru_evicts_the_least_recently_used() {
        let cache = LruMemoryCache::new(2);
        cache.put(key("a"), payload("a"));
        cache.put(key("b"), payload("b"));

        // Touching `a` makes `b` the eviction candidate.
        assert!(cache.get(&key("a")).is_some());
        cache.put(key("c"), payload("c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("c")).is_some());
    }

    #[test]
    fn lru_put_replaces_existing_entries() {
        let cache = LruMemoryCache::new(2);
        cache.put(key("a"), payload("old"));
        cache.put(key("a"), payload("new"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key("a")).unwrap().body, Bytes::from("new"));
    }

    #[test]
    fn lru_remove_and_clear() {
        let cache = LruMemoryCache::new(4);
        cache.put(key("a"), payload("a"));
        cache.put(key("b"), payload("b"));

        cache.remove(&key("a"));
        assert!(cache.get(&key("a")).is_none());
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert_eq!(cache.len(), 0);
        assert!(cache.get(&key("b")).is_none());
    }

    #[test]
    fn weak_prunes_reclaimed_entries() {
        let cache = WeakMemoryCache::new();
        let strong = payload("kept");
        cache.put(key("kept"), Arc::clone(&strong));

        {
            let dropped = payload("dropped");
            cache.put(key("dropped"), dropped);
        }

        assert!(cache.get(&key("dropped")).is_none());
        assert!(cache.get(&key("kept")).is_some());
        // The dead mapping was pruned by the failed lookup.
        assert_eq!(cache.len(), 1);
    }
}
