//! Components A–D: the layered cache stack.
//!
//! `Cache` is the byte-level capability every layer wraps — the remote or
//! in-memory store at the bottom, then (bottom to top) metrics, memoize,
//! hash-indexing. `TypedCache` sits alongside it with a default
//! encode/decode implementation; `MemoizeCache` and `HashIndexedCache`
//! override it with checksum-based decode-skipping and content-hash
//! indexing respectively. Composition, not inheritance: each decorator
//! owns the next layer by value.

pub mod hash_cache;
pub mod hotcache;
pub mod memoize;
pub mod memory;
pub mod metrics_cache;
pub mod redis_store;
pub mod singleflight;

pub use hash_cache::HashIndexedCache;
pub use memoize::{ChecksumKind, MemoizeCache};
pub use memory::InMemoryStore;
pub use metrics_cache::MetricsCache;
pub use redis_store::RedisStore;

use crate::error::CacheError;
use async_trait::async_trait;

/// An ordered, possibly-paginated key enumeration result.
#[derive(Debug, Clone, Default)]
pub struct KeyPage {
    pub keys: Vec<String>,
    /// Opaque cursor for the next page; `None` when enumeration is done.
    pub cursor: Option<String>,
}

/// Uniform Get/Set/Delete/Keys/Scan/HealthCheck surface over an external
/// K/V store or an in-memory substitute. Object-safe so it can be
/// composed behind `Box`/`Arc` where a decorator doesn't need the
/// concrete type of the layer beneath it.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Store the raw bytes `value` under `key` (no codec applied — callers
    /// that want JSON encoding go through `TypedCache::set`).
    async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError>;

    /// Fetch the raw bytes stored under `key`. `CacheError::NotFound` if
    /// absent.
    async fn get_raw(&self, key: &str) -> Result<Vec<u8>, CacheError>;

    /// Delete `key`. Not an error if `key` was already absent.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// List keys matching `pattern` (prefix match for the in-memory store,
    /// glob match for Redis). Prefer `scan` for large key spaces.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// Cursor-based enumeration of keys matching `pattern`. `cursor = None`
    /// starts a new scan; repeat with the returned cursor until it comes
    /// back `None`.
    async fn scan(&self, pattern: &str, cursor: Option<&str>) -> Result<KeyPage, CacheError>;

    /// Whether the underlying store is reachable.
    async fn health_check(&self) -> Result<(), CacheError>;
}

/// Typed convenience layer on top of `Cache`. The default implementation
/// just runs the canonical JSON codec over `get_raw`/`set_bytes`; the
/// memoize and hash-indexed decorators override it to add checksum-based
/// decode-skipping and content-hash indexing.
#[async_trait]
pub trait TypedCache: Cache {
    async fn set<T>(&self, key: &str, value: &T) -> Result<(), CacheError>
    where
        T: serde::Serialize + Clone + Send + Sync + 'static,
    {
        let bytes = crate::util::canonical_json(value)
            .map_err(|e| CacheError::Internal(format!("encode {key}: {e}")))?;
        self.set_bytes(key, bytes).await
    }

    async fn get<T>(&self, key: &str) -> Result<T, CacheError>
    where
        T: serde::de::DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let bytes = self.get_raw(key).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CacheError::Internal(format!("decode {key}: {e}")))
    }
}
