//! Memoize decorator: skips re-unmarshalling a value when its encoded
//! bytes haven't changed since the last read, at the cost of keeping one
//! decoded copy and its checksum per key in memory.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use prometheus::IntCounterVec;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Cache, KeyPage, TypedCache};
use crate::error::CacheError;

/// Which checksum to use to detect whether bytes changed since the last
/// read. CRC32 is the default — cheap, and collisions would only cost an
/// extra unmarshal, never incorrect data (the underlying bytes are always
/// what gets decoded). SHA-256 is available for callers that want
/// cryptographic-strength change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Crc32,
    Sha256,
}

impl Default for ChecksumKind {
    fn default() -> Self {
        ChecksumKind::Crc32
    }
}

impl ChecksumKind {
    fn checksum(self, bytes: &[u8]) -> String {
        match self {
            ChecksumKind::Crc32 => format!("{:08x}", crc32fast::hash(bytes)),
            ChecksumKind::Sha256 => crate::util::sha256_hex(bytes),
        }
    }
}

#[derive(Default)]
pub struct MemoizeCounters {
    pub misses: AtomicU64,
    pub hits: AtomicU64,
    pub hits_with_unmarshal: AtomicU64,
    pub marshals: AtomicU64,
}

impl MemoizeCounters {
    /// Mirror a counter bump onto the Prometheus family, if this instance
    /// was built with a registry (`MemoizeCache::with_registry`).
    fn bump(&self, prom: &Option<IntCounterVec>, label: &str, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(prom) = prom {
            prom.with_label_values(&[label]).inc();
        }
    }
}

struct Memo {
    checksum: String,
    value: Arc<dyn Any + Send + Sync>,
}

pub struct MemoizeCache<C> {
    inner: C,
    checksum_kind: ChecksumKind,
    memo: Mutex<HashMap<String, Memo>>,
    pub counters: MemoizeCounters,
    prom_counters: Option<IntCounterVec>,
}

impl<C: Cache> MemoizeCache<C> {
    pub fn new(inner: C, checksum_kind: ChecksumKind) -> Self {
        Self {
            inner,
            checksum_kind,
            memo: Mutex::new(HashMap::new()),
            counters: MemoizeCounters::default(),
            prom_counters: None,
        }
    }

    /// Like `new`, but also registers the `miss`/`hit`/`hit_with_unmarshal`/
    /// `marshal` counters on `registry` so they show up alongside the rest
    /// of the cache stack's metrics (component D) in `/metrics`.
    pub fn with_registry(inner: C, checksum_kind: ChecksumKind, registry: &prometheus::Registry) -> Self {
        let prom_counters = IntCounterVec::new(
            prometheus::Opts::new(
                "flagproxy_memoize_outcomes_total",
                "Memoize-layer decode outcomes (miss, hit, hit_with_unmarshal, marshal).",
            ),
            &["result"],
        )
        .expect("valid counter opts");
        registry
            .register(Box::new(prom_counters.clone()))
            .expect("duplicate counter registration");

        Self {
            inner,
            checksum_kind,
            memo: Mutex::new(HashMap::new()),
            counters: MemoizeCounters::default(),
            prom_counters: Some(prom_counters),
        }
    }

    fn memo_get<T: Clone + 'static>(&self, key: &str, checksum: &str) -> Option<T> {
        let guard = self.memo.lock().expect("memoize mutex poisoned");
        let entry = guard.get(key)?;
        if entry.checksum != checksum {
            return None;
        }
        entry.value.downcast_ref::<T>().cloned()
    }

    fn memo_put<T: Send + Sync + 'static>(&self, key: String, checksum: String, value: T) {
        let mut guard = self.memo.lock().expect("memoize mutex poisoned");
        guard.insert(
            key,
            Memo {
                checksum,
                value: Arc::new(value),
            },
        );
    }
}

#[async_trait]
impl<C: Cache> Cache for MemoizeCache<C> {
    async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        self.memo.lock().expect("memoize mutex poisoned").remove(key);
        self.inner.set_bytes(key, value).await
    }

    async fn get_raw(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        self.inner.get_raw(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.memo.lock().expect("memoize mutex poisoned").remove(key);
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
impl<C: Cache> TypedCache for MemoizeCache<C> {
    async fn set<T>(&self, key: &str, value: &T) -> Result<(), CacheError>
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        let bytes = crate::util::canonical_json(value)
            .map_err(|e| CacheError::Internal(format!("encode {key}: {e}")))?;
        let checksum = self.checksum_kind.checksum(&bytes);
        self.counters
            .bump(&self.prom_counters, "marshal", &self.counters.marshals);

        self.inner.set_bytes(key, bytes).await?;
        self.memo_put(key.to_string(), checksum, value.clone());
        Ok(())
    }

    async fn get<T>(&self, key: &str) -> Result<T, CacheError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let bytes = match self.inner.get_raw(key).await {
            Ok(b) => b,
            Err(e) => {
                if matches!(e, CacheError::NotFound) {
                    self.counters
                        .bump(&self.prom_counters, "miss", &self.counters.misses);
                }
                return Err(e);
            }
        };
        let checksum = self.checksum_kind.checksum(&bytes);

        if let Some(cached) = self.memo_get::<T>(key, &checksum) {
            self.counters
                .bump(&self.prom_counters, "hit", &self.counters.hits);
            return Ok(cached);
        }

        let decoded: T = serde_json::from_slice(&bytes)
            .map_err(|e| CacheError::Internal(format!("decode {key}: {e}")))?;
        self.counters
            .bump(&self.prom_counters, "miss", &self.counters.misses);
        self.memo_put(key.to_string(), checksum, decoded.clone());
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Widget {
        id: u32,
        name: String,
    }

    #[tokio::test]
    async fn repeated_get_with_unchanged_bytes_skips_unmarshal() {
        let cache = MemoizeCache::new(InMemoryStore::new(), ChecksumKind::Crc32);
        let w = Widget {
            id: 1,
            name: "a".to_string(),
        };
        cache.set("k", &w).await.unwrap();

        let first: Widget = cache.get("k").await.unwrap();
        let second: Widget = cache.get("k").await.unwrap();
        assert_eq!(first, w);
        assert_eq!(second, w);

        assert_eq!(cache.counters.hits.load(Ordering::Relaxed), 2);
        assert_eq!(
            cache.counters.hits_with_unmarshal.load(Ordering::Relaxed),
            0
        );
    }

    #[tokio::test]
    async fn changed_bytes_force_a_fresh_unmarshal() {
        let cache = MemoizeCache::new(InMemoryStore::new(), ChecksumKind::Crc32);
        cache
            .set(
                "k",
                &Widget {
                    id: 1,
                    name: "a".to_string(),
                },
            )
            .await
            .unwrap();
        let _: Widget = cache.get("k").await.unwrap();

        cache
            .set(
                "k",
                &Widget {
                    id: 2,
                    name: "b".to_string(),
                },
            )
            .await
            .unwrap();
        let updated: Widget = cache.get("k").await.unwrap();
        assert_eq!(updated.id, 2);

        assert_eq!(
            cache.counters.hits_with_unmarshal.load(Ordering::Relaxed),
            0
        );
        assert_eq!(cache.counters.hits.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn bytes_never_memoized_count_as_a_miss_not_a_hit_with_unmarshal() {
        let cache = MemoizeCache::new(InMemoryStore::new(), ChecksumKind::Crc32);
        let bytes = crate::util::canonical_json(&Widget {
            id: 1,
            name: "a".to_string(),
        })
        .unwrap();
        cache.set_bytes("k", bytes).await.unwrap();

        let decoded: Widget = cache.get("k").await.unwrap();
        assert_eq!(decoded.id, 1);

        assert_eq!(cache.counters.misses.load(Ordering::Relaxed), 1);
        assert_eq!(cache.counters.hits_with_unmarshal.load(Ordering::Relaxed), 0);
        assert_eq!(cache.counters.hits.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn missing_key_counts_as_a_miss() {
        let cache = MemoizeCache::new(InMemoryStore::new(), ChecksumKind::Crc32);
        let result: Result<Widget, _> = cache.get("missing").await;
        assert!(result.is_err());
        assert_eq!(cache.counters.misses.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn with_registry_exposes_counters_on_the_shared_registry() {
        let registry = prometheus::Registry::new();
        let cache = MemoizeCache::with_registry(InMemoryStore::new(), ChecksumKind::Crc32, &registry);
        cache
            .set(
                "k",
                &Widget {
                    id: 1,
                    name: "a".to_string(),
                },
            )
            .await
            .unwrap();
        let _: Widget = cache.get("k").await.unwrap();

        let families = registry.gather();
        let family = families
            .iter()
            .find(|f| f.name() == "flagproxy_memoize_outcomes_total")
            .expect("memoize counters registered");
        let total: u64 = family.get_metric().iter().map(|m| m.get_counter().get_value() as u64).sum();
        assert!(total >= 2);
    }
}
