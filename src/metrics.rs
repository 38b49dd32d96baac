//! Process-wide metrics registry and the counters owned outside the
//! cache stack (the cache's own metrics live in `cache::metrics_cache`
//! and register themselves against the same `Registry`).

use prometheus::{Encoder, IntCounterVec, Registry, TextEncoder};

pub struct Metrics {
    pub registry: Registry,
    pub refresher_events_total: IntCounterVec,
    pub subscriber_reconnects_total: prometheus::IntCounter,
    pub replica_stream_transitions_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let refresher_events_total = IntCounterVec::new(
            prometheus::Opts::new(
                "flagproxy_refresher_events_total",
                "SSE messages handled by the refresher.",
            ),
            &["domain", "event", "result"],
        )
        .expect("valid counter opts");

        let subscriber_reconnects_total = prometheus::IntCounter::new(
            "flagproxy_subscriber_reconnects_total",
            "Times the SSE subscriber reconnected to the control plane.",
        )
        .expect("valid counter opts");

        let replica_stream_transitions_total = IntCounterVec::new(
            prometheus::Opts::new(
                "flagproxy_replica_stream_transitions_total",
                "Stream health transitions observed by a read replica.",
            ),
            &["state"],
        )
        .expect("valid counter opts");

        registry
            .register(Box::new(refresher_events_total.clone()))
            .expect("duplicate registration");
        registry
            .register(Box::new(subscriber_reconnects_total.clone()))
            .expect("duplicate registration");
        registry
            .register(Box::new(replica_stream_transitions_total.clone()))
            .expect("duplicate registration");

        Self {
            registry,
            refresher_events_total,
            subscriber_reconnects_total,
            replica_stream_transitions_total,
        }
    }

    /// Render every registered metric family in the Prometheus text
    /// exposition format.
    pub fn encode(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .expect("metrics encoding never fails for well-formed families");
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
