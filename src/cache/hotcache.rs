//! Process-local, content-hash-keyed cache of already-decoded values.
//!
//! Used by `HashIndexedCache` to skip both the remote round-trip and the
//! JSON decode for the most recently seen value of a collection. Entries
//! expire after a TTL; a background janitor sweeps expired entries so a
//! long-idle key doesn't pin memory forever.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    expires_at: Instant,
}

/// A TTL'd map from string key to type-erased value, with a background
/// sweep task. Clone is cheap (shares the inner `Arc`s); drop the last
/// clone (or call `shutdown`) to stop the janitor.
pub struct HotCache {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    ttl: Duration,
    janitor: Option<JoinHandle<()>>,
}

impl HotCache {
    pub fn new(ttl: Duration) -> Self {
        let entries: Arc<RwLock<HashMap<String, Entry>>> = Arc::new(RwLock::new(HashMap::new()));
        let janitor = {
            let entries = entries.clone();
            tokio::spawn(async move {
                let sweep_interval = Duration::from_secs(30).min(ttl.max(Duration::from_secs(1)));
                loop {
                    tokio::time::sleep(sweep_interval).await;
                    let now = Instant::now();
                    let mut guard = entries.write().await;
                    guard.retain(|_, e| e.expires_at > now);
                }
            })
        };
        Self {
            entries,
            ttl,
            janitor: Some(janitor),
        }
    }

    /// Fetch `key` if present and not yet expired.
    pub async fn get<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<T> {
        let guard = self.entries.read().await;
        let entry = guard.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        entry.value.downcast_ref::<T>().cloned()
    }

    /// Store `value` under `key` with the cache's configured TTL.
    pub async fn insert<T: Send + Sync + 'static>(&self, key: String, value: T) {
        let mut guard = self.entries.write().await;
        guard.insert(
            key,
            Entry {
                value: Arc::new(value),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub async fn remove(&self, key: &str) {
        let mut guard = self.entries.write().await;
        guard.remove(key);
    }

    /// Stop the background janitor. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.janitor.take() {
            handle.abort();
        }
    }
}

impl Drop for HotCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_and_fetches_typed_values() {
        let cache = HotCache::new(Duration::from_secs(60));
        cache.insert("k".to_string(), 7u32).await;
        assert_eq!(cache.get::<u32>("k").await, Some(7));
        assert_eq!(cache.get::<String>("missing").await, None);
    }

    #[tokio::test]
    async fn expired_entries_are_not_returned() {
        let cache = HotCache::new(Duration::from_millis(10));
        cache.insert("k".to_string(), 1u32).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get::<u32>("k").await, None);
    }

    #[tokio::test]
    async fn remove_clears_entry() {
        let cache = HotCache::new(Duration::from_secs(60));
        cache.insert("k".to_string(), 1u32).await;
        cache.remove("k").await;
        assert_eq!(cache.get::<u32>("k").await, None);
    }
}
