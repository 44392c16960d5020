//! Key/value rendezvous used to bootstrap transport contexts.
//!
//! The process group never talks to the user's store directly: it wraps it
//! in a [`PrefixStore`] per transport context so concurrent contexts cannot
//! collide on keys.

use crate::error::{CohortError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Default deadline for blocking store operations.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(300);

/// Blocking key/value rendezvous.
pub trait Store: Send + Sync {
    /// Set `key` to `value`, overwriting any previous value.
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Get the value for `key`, blocking until it is set or the default
    /// timeout expires.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Block until every key in `keys` is set, up to the default timeout.
    fn wait(&self, keys: &[String]) -> Result<()> {
        self.wait_timeout(keys, DEFAULT_STORE_TIMEOUT)
    }

    /// Block until every key in `keys` is set, up to `timeout`.
    fn wait_timeout(&self, keys: &[String], timeout: Duration) -> Result<()>;
}

/// In-memory store for single-process groups and tests.
pub struct HashStore {
    map: Mutex<HashMap<String, Vec<u8>>>,
    arrived: Condvar,
}

impl HashStore {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            arrived: Condvar::new(),
        }
    }
}

impl Default for HashStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for HashStore {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        map.insert(key.to_owned(), value);
        self.arrived.notify_all();
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let keys = [key.to_owned()];
        self.wait(&keys)?;
        let map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(key).cloned().unwrap_or_default())
    }

    fn wait_timeout(&self, keys: &[String], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(missing) = keys.iter().find(|k| !map.contains_key(*k)) {
                let now = Instant::now();
                if now >= deadline {
                    return Err(CohortError::StoreTimeout {
                        key: missing.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                let (guard, _) = self
                    .arrived
                    .wait_timeout(map, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                map = guard;
            } else {
                return Ok(());
            }
        }
    }
}

/// Namespaces every key of an inner store under a fixed prefix.
pub struct PrefixStore {
    prefix: String,
    inner: Arc<dyn Store>,
}

impl PrefixStore {
    pub fn new(prefix: impl Into<String>, inner: Arc<dyn Store>) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    fn qualify(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }
}

impl Store for PrefixStore {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.set(&self.qualify(key), value)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.inner.get(&self.qualify(key))
    }

    fn wait_timeout(&self, keys: &[String], timeout: Duration) -> Result<()> {
        let qualified: Vec<String> = keys.iter().map(|k| self.qualify(k)).collect();
        self.inner.wait_timeout(&qualified, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_set_then_get() {
        let store = HashStore::new();
        store.set("a", vec![1, 2, 3]).unwrap();
        assert_eq!(store.get("a").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let store = HashStore::new();
        let err = store
            .wait_timeout(&["missing".to_owned()], Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, CohortError::StoreTimeout { .. }));
    }

    #[test]
    fn test_get_blocks_until_set() {
        let store = Arc::new(HashStore::new());
        let setter = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                store.set("late", vec![7]).unwrap();
            })
        };
        assert_eq!(store.get("late").unwrap(), vec![7]);
        setter.join().unwrap();
    }

    #[test]
    fn test_prefix_isolates_namespaces() {
        let inner: Arc<dyn Store> = Arc::new(HashStore::new());
        let a = PrefixStore::new("0", Arc::clone(&inner));
        let b = PrefixStore::new("1", Arc::clone(&inner));
        a.set("key", vec![0]).unwrap();
        assert!(
            b.wait_timeout(&["key".to_owned()], Duration::from_millis(30))
                .is_err()
        );
        b.set("key", vec![1]).unwrap();
        assert_eq!(a.get("key").unwrap(), vec![0]);
        assert_eq!(b.get("key").unwrap(), vec![1]);
    }
}
