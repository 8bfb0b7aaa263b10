use crate::{StoreError, Subscription};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Manages pub-sub subscriptions for [`crate::RedisStore`].
///
/// Each subscription gets its own Redis connection and a forwarding task
/// that bridges messages into the caller's [`Subscription`]. The
/// subscription ends (and the connection drops) when the caller drops the
/// receiving side.
pub struct PubSubManager {
    client: redis::Client,
    active: Arc<RwLock<Vec<String>>>,
}

impl PubSubManager {
    pub fn new(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Connection {
            error: format!("failed to create pub/sub client: {}", e),
        })?;
        Ok(Self {
            client,
            active: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub async fn subscribe(&self, channel: String) -> Result<Subscription, StoreError> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| StoreError::PubSub {
                error: format!("failed to get pub/sub connection: {}", e),
            })?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(&channel)
            .await
            .map_err(|e| StoreError::PubSub {
                error: format!("failed to subscribe to {}: {}", channel, e),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.active.write().await.push(channel.clone());

        let active = self.active.clone();
        let forwarded_channel = channel.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %forwarded_channel, error = %e, "dropping undecodable pub/sub payload");
                        continue;
                    }
                };
                debug!(channel = %forwarded_channel, "forwarding pub/sub message");
                if tx.send(payload).is_err() {
                    break;
                }
            }
            let mut channels = active.write().await;
            if let Some(pos) = channels.iter().position(|c| c == &forwarded_channel) {
                channels.remove(pos);
            }
            info!(channel = %forwarded_channel, "subscription ended");
        });

        Ok(Subscription::new(channel, rx))
    }

    pub async fn active_subscriptions(&self) -> Vec<String> {
        self.active.read().await.clone()
    }
}
