use dashmap::DashMap;
use std::sync::Arc;

/// Process-wide keyed store used for the manifest and compiled-schema caches.
///
/// Injected at construction so tests (and alternative deployments) can supply
/// their own instance and reset it deterministically.
pub trait KeyedStore<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<Arc<V>>;
    fn put(&self, key: &str, value: Arc<V>);
    fn remove(&self, key: &str) -> bool;
    /// Keep only entries for which `keep` returns true.
    fn retain(&self, keep: &dyn Fn(&str) -> bool);
    fn clear(&self);
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory [`KeyedStore`] backed by a `DashMap`.
pub struct MemoryStore<V> {
    entries: DashMap<String, Arc<V>>,
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<V> MemoryStore<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<V: Send + Sync> KeyedStore<V> for MemoryStore<V> {
    fn get(&self, key: &str) -> Option<Arc<V>> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    fn put(&self, key: &str, value: Arc<V>) {
        self.entries.insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn retain(&self, keep: &dyn Fn(&str) -> bool) {
        self.entries.retain(|k, _| keep(k));
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_remove() {
        let store: MemoryStore<String> = MemoryStore::new();
        assert!(store.is_empty());

        store.put("a", Arc::new("one".to_string()));
        assert_eq!(store.get("a").as_deref().map(String::as_str), Some("one"));
        assert!(store.remove("a"));
        assert!(!store.remove("a"));
        assert!(store.get("a").is_none());
    }

    #[test]
    fn test_retain_by_prefix() {
        let store: MemoryStore<u32> = MemoryStore::new();
        store.put("agent-a:input:x", Arc::new(1));
        store.put("agent-a:output:x", Arc::new(2));
        store.put("agent-b:input:x", Arc::new(3));

        store.retain(&|k| !k.starts_with("agent-a:"));
        assert_eq!(store.len(), 1);
        assert!(store.get("agent-b:input:x").is_some());

        store.clear();
        assert!(store.is_empty());
    }
}
