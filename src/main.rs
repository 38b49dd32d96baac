//! flagproxy - configuration cache and change-propagation daemon.

use std::sync::Arc;
use std::time::Duration;

use flagproxy::api::{self, AppState};
use flagproxy::cache::{
    Cache, ChecksumKind, HashIndexedCache, InMemoryStore, MemoizeCache, MetricsCache, RedisStore,
    TypedCache,
};
use flagproxy::config::Config;
use flagproxy::control_plane::HttpControlPlaneClient;
use flagproxy::metrics::Metrics;
use flagproxy::pubsub::{InMemoryPubSub, PubSub, RedisPubSub};
use flagproxy::refresher::Refresher;
use flagproxy::replica::ReplicaStreamHandler;
use flagproxy::stream::StreamSubscriber;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flagproxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(proxy_key = %config.proxy_key, read_replica = config.read_replica, "loaded configuration");

    let metrics = Arc::new(Metrics::new());

    match &config.redis_url {
        Some(url) => {
            let store = RedisStore::connect(url, config.redis_ttl).await?;
            run(config, metrics.clone(), build_stack(store, &metrics.registry)).await
        }
        None => {
            info!("no FLAGPROXY_REDIS_URL set, running with the in-memory store");
            run(
                config,
                metrics.clone(),
                build_stack(InMemoryStore::new(), &metrics.registry),
            )
            .await
        }
    }
}

/// Compose the layered cache stack (components A-D, bottom to top:
/// metrics, memoize, hash-indexing) over `inner`, registering the metrics
/// decorator's families on the same registry the `/metrics` endpoint
/// serves.
fn build_stack<C: Cache + 'static>(
    inner: C,
    registry: &prometheus::Registry,
) -> Arc<HashIndexedCache<MemoizeCache<MetricsCache<C>>>> {
    let metered = MetricsCache::new(inner, registry);
    let memoized = MemoizeCache::with_registry(metered, ChecksumKind::Crc32, registry);
    Arc::new(HashIndexedCache::new(memoized, Duration::from_secs(300)))
}

async fn run<C: TypedCache + 'static>(
    config: Config,
    metrics: Arc<Metrics>,
    cache: Arc<C>,
) -> anyhow::Result<()> {
    let control_plane = Arc::new(HttpControlPlaneClient::new(
        config.control_plane_url.clone(),
        config.account_id.clone(),
        config.sdk_info.clone(),
        config.bearer_token.clone(),
    ));

    let refresher = Arc::new(Refresher::with_metrics(
        control_plane.clone(),
        cache.clone(),
        config.proxy_key.clone(),
        metrics.clone(),
    ));

    if !config.read_replica {
        if let Err(e) = refresher.resync_all().await {
            warn!("startup resync failed, continuing with a possibly-stale cache: {e}");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if config.read_replica {
        let pubsub: Arc<dyn PubSub> = match &config.redis_url {
            Some(url) => Arc::new(RedisPubSub::new(url)?),
            None => Arc::new(InMemoryPubSub::new()),
        };
        let handler = Arc::new(ReplicaStreamHandler::with_metrics(
            refresher.clone(),
            metrics.clone(),
        ));
        let channel = format!("stream-{}", config.proxy_key);
        let replica_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            handler.run(pubsub.as_ref(), &channel, replica_shutdown).await;
            info!("replica stream handler stopped");
        });
    } else {
        let stream_url = format!("{}/stream?key={}", config.control_plane_url, config.proxy_key);
        let subscriber = Arc::new(StreamSubscriber::with_metrics(
            stream_url,
            config.bearer_token.clone(),
            refresher.clone(),
            metrics.clone(),
        ));
        let stream_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            subscriber.run(stream_shutdown).await;
            info!("stream subscriber stopped");
        });
    }

    let app_state = AppState {
        cache: cache.clone() as Arc<dyn Cache>,
        metrics,
    };
    let listener = tokio::net::TcpListener::bind(&config.metrics_addr).await?;
    info!(addr = %config.metrics_addr, "serving /healthz and /metrics");

    let server = axum::serve(listener, api::router(app_state));
    tokio::select! {
        result = server => result.map_err(anyhow::Error::from)?,
        _ = tokio::signal::ctrl_c() => {
            warn!("received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    }

    Ok(())
}
