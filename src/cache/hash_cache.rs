//! Hash-indexed cache: the top of the stack. For "collection" keys (a
//! full set of feature configs or target segments for an environment) it
//! keeps a small `{key}-latest` pointer holding the SHA-256 of the
//! collection's canonical JSON alongside the collection itself. A reader
//! can then compare the pointer to what it last saw and skip both the
//! remote fetch and the decode when nothing changed. Concurrent misses
//! for the same key are coalesced through `SingleFlightGroup` so a burst
//! of readers triggers exactly one fetch from the layer underneath.

use async_trait::async_trait;

use super::hotcache::HotCache;
use super::singleflight::SingleFlightGroup;
use super::{Cache, KeyPage, TypedCache};
use crate::error::CacheError;
use crate::util::{is_collection_key, latest_key, sha256_hex};

pub struct HashIndexedCache<C> {
    inner: C,
    // Keyed by content hash, not by logical key: two readers (or two
    // replicas sharing the same store) that observe the same `-latest`
    // hash converge on the same hot-cache entry after a single miss.
    pub(crate) byte_hot: HotCache,
    pub(crate) typed_hot: HotCache,
    byte_flight: SingleFlightGroup,
    typed_flight: SingleFlightGroup,
}

impl<C: Cache> HashIndexedCache<C> {
    pub fn new(inner: C, hot_cache_ttl: std::time::Duration) -> Self {
        Self {
            inner,
            byte_hot: HotCache::new(hot_cache_ttl),
            typed_hot: HotCache::new(hot_cache_ttl),
            byte_flight: SingleFlightGroup::new(),
            typed_flight: SingleFlightGroup::new(),
        }
    }

    async fn latest_hash(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self.inner.get_raw(&latest_key(key)).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).to_string())),
            Err(CacheError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<C: Cache> Cache for HashIndexedCache<C> {
    async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        if !is_collection_key(key) {
            return self.inner.set_bytes(key, value).await;
        }

        let hash = sha256_hex(&value);
        // Write the value first, then the pointer: a reader that sees an
        // updated pointer is guaranteed the value it points to already
        // exists.
        self.inner.set_bytes(key, value.clone()).await?;
        self.inner
            .set_bytes(&latest_key(key), hash.clone().into_bytes())
            .await?;

        self.byte_hot.insert(hash, value).await;
        Ok(())
    }

    async fn get_raw(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        if !is_collection_key(key) {
            return self.inner.get_raw(key).await;
        }

        let latest = self.latest_hash(key).await?;

        if let Some(latest_hash) = &latest {
            if let Some(cached_bytes) = self.byte_hot.get::<Vec<u8>>(latest_hash).await {
                return Ok(cached_bytes);
            }
        }

        let inner = &self.inner;
        let bytes = self
            .byte_flight
            .run(key, || async move { inner.get_raw(key).await })
            .await?;

        let hash = latest.unwrap_or_else(|| sha256_hex(&bytes));
        self.byte_hot.insert(hash, bytes.clone()).await;
        Ok(bytes)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        if is_collection_key(key) {
            self.inner.delete(&latest_key(key)).await?;
        }
        self.inner.delete(key).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.inner.keys(pattern).await
    }

    async fn scan(&self, pattern: &str, cursor: Option<&str>) -> Result<KeyPage, CacheError> {
        self.inner.scan(pattern, cursor).await
    }

    async fn health_check(&self) -> Result<(), CacheError> {
        self.inner.health_check().await
    }
}

#[async_trait]
impl<C: TypedCache> TypedCache for HashIndexedCache<C> {
    async fn set<T>(&self, key: &str, value: &T) -> Result<(), CacheError>
    where
        T: serde::Serialize + Clone + Send + Sync + 'static,
    {
        if !is_collection_key(key) {
            return self.inner.set(key, value).await;
        }

        let bytes = crate::util::canonical_json(value)
            .map_err(|e| CacheError::Internal(format!("encode {key}: {e}")))?;
        let hash = sha256_hex(&bytes);

        self.inner.set(key, value).await?;
        self.inner
            .set_bytes(&latest_key(key), hash.clone().into_bytes())
            .await?;

        self.typed_hot.insert(hash, value.clone()).await;
        Ok(())
    }

    async fn get<T>(&self, key: &str) -> Result<T, CacheError>
    where
        T: serde::de::DeserializeOwned + Clone + Send + Sync + 'static,
    {
        if !is_collection_key(key) {
            return self.inner.get(key).await;
        }

        let latest = self.latest_hash(key).await?;

        if let Some(latest_hash) = &latest {
            if let Some(cached_value) = self.typed_hot.get::<T>(latest_hash).await {
                return Ok(cached_value);
            }
        }

        let inner = &self.inner;
        let value: T = self
            .typed_flight
            .run(key, || async move { inner.get::<T>(key).await })
            .await?;

        let hash = match &latest {
            Some(h) => h.clone(),
            None => {
                let bytes = crate::util::canonical_json(&value)
                    .map_err(|e| CacheError::Internal(format!("hash {key}: {e}")))?;
                sha256_hex(&bytes)
            }
        };
        self.typed_hot.insert(hash, value.clone()).await;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryStore;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Collection {
        items: Vec<u32>,
    }

    #[tokio::test]
    async fn set_writes_value_before_latest_pointer() {
        let store = InMemoryStore::new();
        let cache = HashIndexedCache::new(store, Duration::from_secs(60));

        let value = Collection { items: vec![1, 2] };
        cache.set("env-1-feature-configs", &value).await.unwrap();

        let pointer = cache
            .inner
            .get_raw("env-1-feature-configs-latest")
            .await
            .unwrap();
        let expected_hash = sha256_hex(&crate::util::canonical_json(&value).unwrap());
        assert_eq!(String::from_utf8(pointer).unwrap(), expected_hash);
    }

    #[tokio::test]
    async fn unchanged_latest_pointer_serves_from_hot_cache() {
        let store = InMemoryStore::new();
        let cache = HashIndexedCache::new(store, Duration::from_secs(60));

        let value = Collection { items: vec![1, 2] };
        cache.set("env-1-feature-configs", &value).await.unwrap();

        // Clear the inner value (but not the pointer) to prove the second
        // read comes from the hot cache, not a fresh fetch.
        cache.inner.delete("env-1-feature-configs").await.unwrap();

        let fetched: Collection = cache.get("env-1-feature-configs").await.unwrap();
        assert_eq!(fetched, value);
    }

    #[tokio::test]
    async fn changed_value_invalidates_the_hot_cache() {
        let store = InMemoryStore::new();
        let cache = HashIndexedCache::new(store, Duration::from_secs(60));

        let v1 = Collection { items: vec![1] };
        cache.set("env-1-feature-configs", &v1).await.unwrap();
        let first: Collection = cache.get("env-1-feature-configs").await.unwrap();
        assert_eq!(first, v1);

        let v2 = Collection { items: vec![2] };
        cache.set("env-1-feature-configs", &v2).await.unwrap();
        let second: Collection = cache.get("env-1-feature-configs").await.unwrap();
        assert_eq!(second, v2);
    }

    /// Counts `get_raw` calls per key, so tests can assert a given key was
    /// never (or exactly once) read from the underlying store.
    #[derive(Default)]
    struct CountingStore {
        inner: InMemoryStore,
        get_raw_counts: std::sync::Mutex<HashMap<String, u32>>,
    }

    #[async_trait]
    impl Cache for CountingStore {
        async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
            self.inner.set_bytes(key, value).await
        }

        async fn get_raw(&self, key: &str) -> Result<Vec<u8>, CacheError> {
            *self
                .get_raw_counts
                .lock()
                .expect("counting mutex poisoned")
                .entry(key.to_string())
                .or_insert(0) += 1;
            self.inner.get_raw(key).await
        }

        async fn delete(&self, key: &str) -> Result<(), CacheError> {
            self.inner.delete(key).await
        }

        async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
            self.inner.keys(pattern).await
        }

        async fn scan(&self, pattern: &str, cursor: Option<&str>) -> Result<KeyPage, CacheError> {
            self.inner.scan(pattern, cursor).await
        }

        async fn health_check(&self) -> Result<(), CacheError> {
            self.inner.health_check().await
        }
    }

    impl TypedCache for CountingStore {}

    #[tokio::test]
    async fn preseeded_hot_cache_entry_is_served_without_reading_the_collection_key() {
        let store = CountingStore::default();
        let value = Collection { items: vec![9, 9] };
        let bytes = crate::util::canonical_json(&value).unwrap();
        let hash = sha256_hex(&bytes);

        // Seed the `-latest` pointer directly, and the hot cache by hash
        // alone, the way a second replica that already saw this hash would
        // arrive at the same entry without ever fetching the collection.
        store
            .set_bytes("env-1-segments-latest", hash.clone().into_bytes())
            .await
            .unwrap();

        let cache = HashIndexedCache::new(store, Duration::from_secs(60));
        cache.typed_hot.insert(hash, value.clone()).await;

        let fetched: Collection = cache.get("env-1-segments").await.unwrap();
        assert_eq!(fetched, value);

        let counts = cache.inner.get_raw_counts.lock().unwrap();
        assert_eq!(counts.get("env-1-segments"), None);
        assert_eq!(counts.get("env-1-segments-latest").copied(), Some(1));
    }

    #[tokio::test]
    async fn non_collection_keys_bypass_indexing() {
        let store = InMemoryStore::new();
        let cache = HashIndexedCache::new(store, Duration::from_secs(60));

        cache.set_bytes("env-1-feature-config-abc", b"raw".to_vec()).await.unwrap();
        assert_eq!(
            cache.inner.get_raw("env-1-feature-config-abc-latest").await.unwrap_err().to_string(),
            CacheError::NotFound.to_string()
        );
    }
}
