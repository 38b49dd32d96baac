//! Reconnecting SSE client: holds a connection to the control plane's
//! event stream open, decodes each event into an `SSEMessage`, and hands
//! it to the refresher. A dropped connection is retried after a fixed
//! delay rather than with backoff — the control plane endpoint this talks
//! to is expected to be highly available, so a fixed retry keeps
//! reconnect latency predictable.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::TypedCache;
use crate::control_plane::ControlPlaneClient;
use crate::metrics::Metrics;
use crate::refresher::{Refresher, RefresherOutcome, SSEMessage};

const RECONNECT_DELAY: Duration = Duration::from_secs(30);

pub struct StreamSubscriber<CP, C> {
    stream_url: String,
    bearer_token: String,
    refresher: Arc<Refresher<CP, C>>,
    metrics: Option<Arc<Metrics>>,
}

impl<CP: ControlPlaneClient + 'static, C: TypedCache + 'static> StreamSubscriber<CP, C> {
    pub fn new(stream_url: String, bearer_token: String, refresher: Arc<Refresher<CP, C>>) -> Self {
        Self {
            stream_url,
            bearer_token,
            refresher,
            metrics: None,
        }
    }

    /// Like `new`, but records each reconnect on
    /// `metrics.subscriber_reconnects_total`.
    pub fn with_metrics(
        stream_url: String,
        bearer_token: String,
        refresher: Arc<Refresher<CP, C>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::new(stream_url, bearer_token, refresher)
        }
    }

    /// Run until `shutdown` fires or the refresher reports a terminal
    /// message (`proxyKeyDeleted`).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut first_connection = true;
        loop {
            if *shutdown.borrow() {
                return;
            }

            if !first_connection {
                if let Some(metrics) = &self.metrics {
                    metrics.subscriber_reconnects_total.inc();
                }
            }
            first_connection = false;

            match self.connect_and_forward(&mut shutdown).await {
                Ok(RefresherOutcome::ShutdownRequested) => {
                    info!("stream subscriber received shutdown request from control plane");
                    return;
                }
                Ok(RefresherOutcome::Handled) | Err(_) => {}
            }

            if *shutdown.borrow() {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn connect_and_forward(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<RefresherOutcome, ()> {
        let client = reqwest::Client::new();
        let request = client
            .get(&self.stream_url)
            .bearer_auth(&self.bearer_token);

        let mut source = match EventSource::new(request) {
            Ok(source) => source,
            Err(e) => {
                warn!("failed to open event source: {e}");
                return Err(());
            }
        };

        loop {
            tokio::select! {
                event = source.next() => {
                    match event {
                        Some(Ok(Event::Open)) => debug!("stream connected"),
                        Some(Ok(Event::Message(message))) => {
                            match serde_json::from_str::<SSEMessage>(&message.data) {
                                Ok(parsed) => match self.refresher.handle(parsed).await {
                                    Ok(RefresherOutcome::ShutdownRequested) => {
                                        return Ok(RefresherOutcome::ShutdownRequested);
                                    }
                                    Ok(RefresherOutcome::Handled) => {}
                                    Err(e) => warn!("refresher failed to handle message: {e}"),
                                },
                                Err(e) => {
                                    debug!("dropping unparseable SSE message: {e}");
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!("stream error, reconnecting: {e}");
                            return Ok(RefresherOutcome::Handled);
                        }
                        None => return Ok(RefresherOutcome::Handled),
                    }
                }
                _ = shutdown.changed() => return Ok(RefresherOutcome::Handled),
            }
        }
    }
}
