//! Process-lifetime caches shared by concurrently processed results
//!
//! Entries are never evicted. Keys derive from identity or content, so two
//! writers racing on the same key store equivalent values and last write wins.

use dashmap::DashMap;
use std::hash::Hash;
use std::path::PathBuf;

use crate::types::TestIdentity;

/// Unbounded concurrent map constructed once and injected where needed
#[derive(Debug)]
pub struct Cache<K: Eq + Hash, V> {
    entries: DashMap<K, V>,
}

impl<K: Eq + Hash, V: Clone> Cache<K, V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn set(&self, key: K, value: V) {
        self.entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash, V: Clone> Default for Cache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Key of the expected-image cache: a test and one of its screenshot states
pub type ExpectedPathKey = (TestIdentity, Option<String>);

/// Report-relative path of the expected image last stored for a state
pub type ExpectedPathCache = Cache<ExpectedPathKey, String>;

/// Diff image already produced for an (actual, expected) content hash pair
pub type DiffCache = Cache<String, PathBuf>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins() {
        let cache: ExpectedPathCache = Cache::new();
        let key = (TestIdentity::new(["a"], "chrome"), Some("plain".to_string()));

        cache.set(key.clone(), "images/one.png".into());
        cache.set(key.clone(), "images/two.png".into());

        assert_eq!(cache.get(&key).as_deref(), Some("images/two.png"));
        assert_eq!(cache.len(), 1);
    }
}
