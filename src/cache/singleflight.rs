//! Request coalescing: when many callers ask for the same key at once,
//! only the first actually runs the fetch; the rest await its outcome.
//!
//! Keyed on an arbitrary `String`, type-erased via `Any` so one group can
//! coalesce fetches that return different concrete types (a flag
//! collection here, a segment collection there). `tokio::sync::OnceCell`
//! is the coalescing primitive itself — the group is just a synchronized
//! map from key to a shared cell.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::error::CacheError;

type Slot = Arc<OnceCell<Result<Arc<dyn Any + Send + Sync>, CacheError>>>;

/// Coalesces concurrent fetches for the same key into a single in-flight
/// call. Entries are removed once the cell has resolved so a later,
/// independent fetch for the same key starts a fresh call rather than
/// replaying a stale result.
#[derive(Default)]
pub struct SingleFlightGroup {
    inflight: Mutex<HashMap<String, Slot>>,
}

impl SingleFlightGroup {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `fut` under single-flight for `key`. Concurrent callers for the
    /// same key share one execution of `fut` and each receive a cloned
    /// copy of its outcome.
    pub async fn run<T, F, Fut>(&self, key: &str, fut: F) -> Result<T, CacheError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let slot = {
            let mut inflight = self.inflight.lock().expect("singleflight mutex poisoned");
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = slot
            .get_or_init(|| async move {
                let outcome = fut().await;
                outcome.map(|v| Arc::new(v) as Arc<dyn Any + Send + Sync>)
            })
            .await
            .clone();

        {
            let mut inflight = self.inflight.lock().expect("singleflight mutex poisoned");
            if let Some(existing) = inflight.get(key) {
                if Arc::ptr_eq(existing, &slot) {
                    inflight.remove(key);
                }
            }
        }

        match result {
            Ok(boxed) => Ok(boxed
                .downcast_ref::<T>()
                .cloned()
                .expect("singleflight type mismatch for key")),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn coalesces_concurrent_calls_for_the_same_key() {
        let group = Arc::new(SingleFlightGroup::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let group = group.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                group
                    .run("k", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok::<_, CacheError>(42u32)
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let group = SingleFlightGroup::new();
        let a = group.run("a", || async { Ok::<_, CacheError>(1u32) }).await;
        let b = group.run("b", || async { Ok::<_, CacheError>(2u32) }).await;
        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 2);
    }

    #[tokio::test]
    async fn a_later_call_for_the_same_key_runs_again() {
        let group = SingleFlightGroup::new();
        let calls = Arc::new(AtomicU32::new(0));

        let calls2 = calls.clone();
        group
            .run("k", || async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CacheError>(1u32)
            })
            .await
            .unwrap();

        let calls3 = calls.clone();
        group
            .run("k", || async move {
                calls3.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CacheError>(2u32)
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn propagates_errors_to_all_waiters() {
        let group = Arc::new(SingleFlightGroup::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let group = group.clone();
            handles.push(tokio::spawn(async move {
                group
                    .run("k", || async move {
                        Err::<u32, _>(CacheError::Internal("boom".to_string()))
                    })
                    .await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_err());
        }
    }
}
