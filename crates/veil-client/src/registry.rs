//! Atomic get-or-create driver registries.
//!
//! Session drivers are created lazily on first contact. Two concurrent
//! first-contacts with the same id must not each build a driver, or the
//! two ratchets diverge immediately, so creation happens under the
//! registry lock. Each driver sits behind its own mutex; ratchet state
//! is never mutated by two operations at once, while operations on
//! different peers or groups proceed in parallel.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::error::ClientError;

/// A map of drivers with atomic get-or-create.
pub struct Registry<K, V> {
    inner: Mutex<HashMap<K, Arc<Mutex<V>>>>,
}

/// Lock a driver handed out by a [`Registry`].
pub fn lock_driver<V>(driver: &Arc<Mutex<V>>) -> MutexGuard<'_, V> {
    driver.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K: Eq + Hash + Clone, V> Registry<K, V> {
    /// An empty registry.
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Arc<Mutex<V>>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The driver for `key`, if one exists.
    pub fn get(&self, key: &K) -> Option<Arc<Mutex<V>>> {
        self.lock().get(key).cloned()
    }

    /// The driver for `key`, creating it if absent.
    ///
    /// The registry lock is held across `create`, so a concurrent call
    /// for the same key observes the finished driver and never builds a
    /// second one. A failed `create` inserts nothing.
    pub fn get_or_create(
        &self,
        key: &K,
        create: impl FnOnce() -> Result<V, ClientError>,
    ) -> Result<Arc<Mutex<V>>, ClientError> {
        let mut inner = self.lock();
        if let Some(existing) = inner.get(key) {
            return Ok(Arc::clone(existing));
        }
        let driver = Arc::new(Mutex::new(create()?));
        inner.insert(key.clone(), Arc::clone(&driver));
        Ok(driver)
    }

    /// Insert a driver built elsewhere, replacing any existing one.
    pub fn insert(&self, key: K, value: V) -> Arc<Mutex<V>> {
        let driver = Arc::new(Mutex::new(value));
        self.lock().insert(key, Arc::clone(&driver));
        driver
    }

    /// Drop the driver for `key`.
    pub fn remove(&self, key: &K) {
        self.lock().remove(key);
    }

    /// Whether a driver exists for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }
}

impl<K: Eq + Hash + Clone, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_returns_the_same_driver() {
        let registry: Registry<&str, u32> = Registry::new();

        let first = registry.get_or_create(&"alice", || Ok(1)).expect("create");
        let second = registry.get_or_create(&"alice", || Ok(2)).expect("get");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*lock_driver(&second), 1);
    }

    #[test]
    fn failed_creation_inserts_nothing() {
        let registry: Registry<&str, u32> = Registry::new();

        let result = registry
            .get_or_create(&"alice", || Err(ClientError::Protocol("no bundle".to_owned())));
        assert!(result.is_err());
        assert!(!registry.contains(&"alice"));
    }

    #[test]
    fn removal_allows_recreation() {
        let registry: Registry<&str, u32> = Registry::new();
        let _ = registry.get_or_create(&"alice", || Ok(1)).expect("create");

        registry.remove(&"alice");
        let rebuilt = registry.get_or_create(&"alice", || Ok(9)).expect("recreate");
        assert_eq!(*lock_driver(&rebuilt), 9);
    }
}
