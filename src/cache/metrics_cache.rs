//! Metrics decorator: wraps any `Cache` and records per-operation latency
//! and outcome without changing behaviour.

use std::time::Instant;

use async_trait::async_trait;
use prometheus::{HistogramVec, IntCounterVec, Registry};

use super::{Cache, KeyPage, TypedCache};
use crate::error::CacheError;

pub struct MetricsCache<C> {
    inner: C,
    durations: HistogramVec,
    scan_durations: HistogramVec,
    requests: IntCounterVec,
}

impl<C: Cache> MetricsCache<C> {
    /// Wrap `inner`, registering this decorator's metrics on `registry`.
    /// Buckets run up to 500ms — this is a local-cache-path decorator, not
    /// one meant to time slow upstream calls.
    pub fn new(inner: C, registry: &Registry) -> Self {
        let durations = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "flagproxy_cache_operation_duration_seconds",
                "Duration of cache operations.",
            )
            .buckets(vec![
                0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.1, 0.2, 0.5,
            ]),
            &["operation"],
        )
        .expect("valid histogram opts");

        // Scan/Keys enumerate the whole key space and can legitimately run
        // much longer than a point Get/Set, so they get their own buckets
        // rather than skewing the point-operation histogram.
        let scan_durations = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "flagproxy_cache_scan_duration_seconds",
                "Duration of cache scan/keys enumeration operations.",
            )
            .buckets(vec![0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0]),
            &["operation"],
        )
        .expect("valid histogram opts");

        let requests = IntCounterVec::new(
            prometheus::Opts::new(
                "flagproxy_cache_requests_total",
                "Cache operation outcomes.",
            ),
            &["operation", "key", "error"],
        )
        .expect("valid counter opts");

        registry
            .register(Box::new(durations.clone()))
            .expect("duplicate histogram registration");
        registry
            .register(Box::new(scan_durations.clone()))
            .expect("duplicate histogram registration");
        registry
            .register(Box::new(requests.clone()))
            .expect("duplicate counter registration");

        Self {
            inner,
            durations,
            scan_durations,
            requests,
        }
    }

    fn record<T>(&self, operation: &str, key: &str, start: Instant, result: &Result<T, CacheError>) {
        self.durations
            .with_label_values(&[operation])
            .observe(start.elapsed().as_secs_f64());
        self.finish(operation, key, result);
    }

    fn record_scan<T>(&self, operation: &str, key: &str, start: Instant, result: &Result<T, CacheError>) {
        self.scan_durations
            .with_label_values(&[operation])
            .observe(start.elapsed().as_secs_f64());
        self.finish(operation, key, result);
    }

    fn finish<T>(&self, operation: &str, key: &str, result: &Result<T, CacheError>) {
        let error_label = match result {
            Ok(_) => "".to_string(),
            Err(e) if !e.is_metrics_error() => "".to_string(),
            Err(e) => e.to_string(),
        };
        self.requests
            .with_label_values(&[operation, key, &error_label])
            .inc();
    }
}

#[async_trait]
impl<C: Cache> Cache for MetricsCache<C> {
    async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        let start = Instant::now();
        let result = self.inner.set_bytes(key, value).await;
        self.record("set", key, start, &result);
        result
    }

    async fn get_raw(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let start = Instant::now();
        let result = self.inner.get_raw(key).await;
        self.record("get", key, start, &result);
        result
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let start = Instant::now();
        let result = self.inner.delete(key).await;
        self.record("delete", key, start, &result);
        result
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let start = Instant::now();
        let result = self.inner.keys(pattern).await;
        self.record_scan("keys", pattern, start, &result);
        result
    }

    async fn scan(&self, pattern: &str, cursor: Option<&str>) -> Result<KeyPage, CacheError> {
        let start = Instant::now();
        let result = self.inner.scan(pattern, cursor).await;
        self.record_scan("scan", pattern, start, &result);
        result
    }

    async fn health_check(&self) -> Result<(), CacheError> {
        let start = Instant::now();
        let result = self.inner.health_check().await;
        self.record("health_check", "", start, &result);
        result
    }
}

impl<C: Cache> TypedCache for MetricsCache<C> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryStore;

    #[tokio::test]
    async fn wraps_inner_cache_transparently() {
        let registry = Registry::new();
        let cache = MetricsCache::new(InMemoryStore::new(), &registry);
        cache.set_bytes("k", b"v".to_vec()).await.unwrap();
        assert_eq!(cache.get_raw("k").await.unwrap(), b"v".to_vec());

        let families = registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.name()).collect();
        assert!(names.contains(&"flagproxy_cache_requests_total"));
        assert!(names.contains(&"flagproxy_cache_operation_duration_seconds"));
    }

    #[tokio::test]
    async fn scan_and_keys_record_onto_the_scan_histogram_not_the_operation_one() {
        let registry = Registry::new();
        let cache = MetricsCache::new(InMemoryStore::new(), &registry);
        cache.set_bytes("k", b"v".to_vec()).await.unwrap();
        cache.keys("k").await.unwrap();
        cache.scan("k", None).await.unwrap();

        let families = registry.gather();
        let scan_family = families
            .iter()
            .find(|f| f.name() == "flagproxy_cache_scan_duration_seconds")
            .expect("scan histogram registered");
        let total_samples: u64 = scan_family
            .get_metric()
            .iter()
            .map(|m| m.get_histogram().get_sample_count())
            .sum();
        assert_eq!(total_samples, 2);

        let op_family = families
            .iter()
            .find(|f| f.name() == "flagproxy_cache_operation_duration_seconds")
            .expect("operation histogram registered");
        let op_samples: u64 = op_family
            .get_metric()
            .iter()
            .map(|m| m.get_histogram().get_sample_count())
            .sum();
        assert_eq!(op_samples, 1);
    }

    #[tokio::test]
    async fn not_found_is_not_counted_as_an_error_label() {
        let registry = Registry::new();
        let cache = MetricsCache::new(InMemoryStore::new(), &registry);
        assert!(cache.get_raw("missing").await.is_err());

        let families = registry.gather();
        let requests = families
            .iter()
            .find(|f| f.name() == "flagproxy_cache_requests_total")
            .unwrap();
        for metric in requests.get_metric() {
            let error_label = metric
                .get_label()
                .iter()
                .find(|l| l.name() == "error")
                .unwrap();
            assert_eq!(error_label.value(), "");
        }
    }
}
