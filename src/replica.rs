//! Component H: read-replica mode. Instead of talking to the control
//! plane's SSE stream directly, a replica subscribes to a pub/sub channel
//! fed by the proxy instance that owns the upstream connection, and
//! tracks that upstream connection's health so it can fail closed rather
//! than silently serve stale data.

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{info, warn};

use crate::cache::TypedCache;
use crate::control_plane::ControlPlaneClient;
use crate::metrics::Metrics;
use crate::pubsub::PubSub;
use crate::refresher::{Refresher, RefresherOutcome, SSEMessage};

/// The owning proxy's upstream stream connectivity, as last observed by
/// this replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Initializing,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct StreamHealth {
    pub state: StreamState,
    pub since: Instant,
}

impl Default for StreamHealth {
    fn default() -> Self {
        Self {
            state: StreamState::Initializing,
            since: Instant::now(),
        }
    }
}

/// Relayed control message: either a stream-connectivity signal from the
/// owning proxy, or a regular SSE message to apply to the local cache the
/// same way the non-replica subscriber would.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind")]
enum RelayedMessage {
    #[serde(rename = "stream_action")]
    StreamAction { action: String },
    #[serde(rename = "sse_message")]
    Sse(SSEMessage),
}

pub struct ReplicaStreamHandler<CP, C> {
    refresher: Arc<Refresher<CP, C>>,
    health: Arc<RwLock<StreamHealth>>,
    metrics: Option<Arc<Metrics>>,
}

impl<CP: ControlPlaneClient, C: TypedCache> ReplicaStreamHandler<CP, C> {
    pub fn new(refresher: Arc<Refresher<CP, C>>) -> Self {
        Self {
            refresher,
            health: Arc::new(RwLock::new(StreamHealth::default())),
            metrics: None,
        }
    }

    /// Like `new`, but records each stream-health transition on
    /// `metrics.replica_stream_transitions_total`.
    pub fn with_metrics(refresher: Arc<Refresher<CP, C>>, metrics: Arc<Metrics>) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::new(refresher)
        }
    }

    pub fn health(&self) -> Arc<RwLock<StreamHealth>> {
        self.health.clone()
    }

    /// Consume relayed messages from `pubsub` on `channel` until `shutdown`
    /// fires.
    pub async fn run(
        &self,
        pubsub: &dyn PubSub,
        channel: &str,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut rx = match pubsub.subscribe(channel).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("replica failed to subscribe to {channel}: {e}");
                return;
            }
        };

        loop {
            tokio::select! {
                message = rx.recv() => {
                    match message {
                        Ok(payload) => self.handle_payload(&payload).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("replica lagged behind pub/sub stream by {n} messages");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn handle_payload(&self, payload: &str) {
        let parsed: RelayedMessage = match serde_json::from_str(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!("dropping unparseable relayed message: {e}");
                return;
            }
        };

        match parsed {
            RelayedMessage::StreamAction { action } => self.apply_stream_action(&action).await,
            RelayedMessage::Sse(msg) => match self.refresher.handle(msg).await {
                Ok(RefresherOutcome::ShutdownRequested) => {
                    info!("replica received a terminal message from the relay");
                }
                Ok(RefresherOutcome::Handled) => {}
                Err(e) => warn!("replica failed to apply relayed message: {e}"),
            },
        }
    }

    async fn apply_stream_action(&self, action: &str) {
        let mut health = self.health.write().await;
        match action {
            "connect" => {
                health.state = StreamState::Connected;
                health.since = Instant::now();
            }
            "disconnect" => {
                health.state = StreamState::Disconnected;
                health.since = Instant::now();
            }
            other => {
                warn!("unknown stream_action: {other}");
                return;
            }
        }
        drop(health);
        if let Some(metrics) = &self.metrics {
            metrics
                .replica_stream_transitions_total
                .with_label_values(&[action])
                .inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryStore;
    use crate::control_plane::FakeControlPlaneClient;
    use crate::pubsub::InMemoryPubSub;

    fn handler() -> ReplicaStreamHandler<FakeControlPlaneClient, InMemoryStore> {
        let refresher = Arc::new(Refresher::new(
            Arc::new(FakeControlPlaneClient::default()),
            Arc::new(InMemoryStore::new()),
            "pk".to_string(),
        ));
        ReplicaStreamHandler::new(refresher)
    }

    #[tokio::test]
    async fn starts_initializing() {
        let handler = handler();
        assert_eq!(handler.health().read().await.state, StreamState::Initializing);
    }

    #[tokio::test]
    async fn stream_action_connect_marks_healthy() {
        let handler = handler();
        handler.apply_stream_action("connect").await;
        assert_eq!(handler.health().read().await.state, StreamState::Connected);
    }

    #[tokio::test]
    async fn stream_action_transitions_are_counted_when_metrics_are_wired() {
        let metrics = Arc::new(Metrics::new());
        let refresher = Arc::new(Refresher::new(
            Arc::new(FakeControlPlaneClient::default()),
            Arc::new(InMemoryStore::new()),
            "pk".to_string(),
        ));
        let handler = ReplicaStreamHandler::with_metrics(refresher, metrics.clone());

        handler.apply_stream_action("connect").await;
        handler.apply_stream_action("disconnect").await;
        handler.apply_stream_action("bogus").await;

        assert_eq!(
            metrics
                .replica_stream_transitions_total
                .with_label_values(&["connect"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .replica_stream_transitions_total
                .with_label_values(&["disconnect"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .replica_stream_transitions_total
                .with_label_values(&["bogus"])
                .get(),
            0
        );
    }

    #[tokio::test]
    async fn stream_action_disconnect_marks_unhealthy() {
        let handler = handler();
        handler.apply_stream_action("connect").await;
        handler.apply_stream_action("disconnect").await;
        assert_eq!(
            handler.health().read().await.state,
            StreamState::Disconnected
        );
    }

    #[tokio::test]
    async fn run_relays_stream_actions_from_pubsub() {
        let pubsub = Arc::new(InMemoryPubSub::new());
        let handler = Arc::new(handler());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handler2 = handler.clone();
        let pubsub2 = pubsub.clone();
        let task = tokio::spawn(async move {
            handler2.run(pubsub2.as_ref(), "replica", shutdown_rx).await;
        });

        // give the subscriber a moment to attach before publishing
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        pubsub
            .publish(
                "replica",
                serde_json::json!({"kind": "stream_action", "action": "connect"}).to_string(),
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(handler.health().read().await.state, StreamState::Connected);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
