use std::collections::HashMap;
use std::hash::Hash;

/// Groups one-to-many child rows by parent id while hydrating messages. Built
/// once per query from a full child-table scan, then consumed per message.
pub(crate) struct MultiMap<K, V> {
    map: HashMap<K, Vec<V>>,
}

impl<K: Eq + Hash, V> MultiMap<K, V> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn add(&mut self, key: K, value: V) {
        self.map.entry(key).or_default().push(value);
    }

    /// Removes and returns the children for `key`, empty if none were added.
    pub fn take(&mut self, key: &K) -> Vec<V> {
        self.map.remove(key).unwrap_or_default()
    }
}
