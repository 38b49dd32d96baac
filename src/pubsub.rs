//! Publish/subscribe abstraction used by the read-replica handler to
//! learn about upstream stream connectivity changes and relayed SSE
//! messages without talking to the control plane directly.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::CacheError;

const CHANNEL_CAPACITY: usize = 256;

#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), CacheError>;
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, CacheError>;
}

/// In-process pub/sub, used for tests and single-replica deployments.
#[derive(Default)]
pub struct InMemoryPubSub {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut guard = self.channels.lock().expect("pubsub mutex poisoned");
        guard
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), CacheError> {
        // No subscribers is not an error — it just means nobody's listening
        // yet.
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, CacheError> {
        Ok(self.sender(channel).subscribe())
    }
}

/// Redis-backed pub/sub for multi-replica deployments. Each `subscribe`
/// opens a dedicated connection and forwards messages into a local
/// broadcast channel, since a single Redis connection can only be in
/// pub/sub mode for one set of channels at a time.
pub struct RedisPubSub {
    client: redis::Client,
}

impl RedisPubSub {
    pub fn new(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)
            .map_err(|e| CacheError::ConnRefused(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), CacheError> {
        let mut conn = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| CacheError::ConnRefused(e.to_string()))?;
        redis::AsyncCommands::publish::<_, _, ()>(&mut conn, channel, payload)
            .await
            .map_err(|e| CacheError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, CacheError> {
        let conn = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| CacheError::ConnRefused(e.to_string()))?;
        let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);

        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut pubsub = conn;
            if pubsub.subscribe(&channel).await.is_err() {
                return;
            }
            let mut stream = pubsub.on_message();
            use futures_util::StreamExt;
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if tx.send(payload).is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_pubsub_delivers_to_subscriber() {
        let pubsub = InMemoryPubSub::new();
        let mut rx = pubsub.subscribe("ch").await.unwrap();
        pubsub.publish("ch", "hello".to_string()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_not_an_error() {
        let pubsub = InMemoryPubSub::new();
        assert!(pubsub.publish("ch", "hello".to_string()).await.is_ok());
    }
}
