//! Pub/sub bus adapters.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::collections::HashMap;
use tokio::sync::broadcast;
use trade_engine_core::PubSub;

/// Redis `PUBLISH` / `SUBSCRIBE`.
pub struct RedisBus {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisBus {
    /// # Errors
    /// Returns an error if the client cannot be created or the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl PubSub for RedisBus {
    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("PUBLISH to {channel} failed"))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("Failed to open Redis pub/sub connection")?;
        pubsub
            .subscribe(channel)
            .await
            .with_context(|| format!("SUBSCRIBE to {channel} failed"))?;

        let messages = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::debug!("Dropping non-text pub/sub payload: {e}");
                    None
                }
            }
        });
        Ok(messages.boxed())
    }
}

/// In-process bus over tokio broadcast channels.
///
/// A subscriber that falls more than `capacity` messages behind skips the
/// overflow, the same way a slow Redis subscriber would be disconnected.
pub struct MemoryBus {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(4_096)
    }
}

impl MemoryBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Number of live subscriptions on `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Ends every subscription stream.
    pub fn close(&self) {
        self.channels.lock().clear();
    }
}

#[async_trait]
impl PubSub for MemoryBus {
    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        // Publishing with no subscriber is not an error, matching Redis.
        let _ = self.sender(channel).send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let rx = self.sender(channel).subscribe();
        let messages = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Subscriber lagged, messages skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(messages.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_bus_delivers_in_order_per_channel() {
        let bus = MemoryBus::default();
        let mut a = bus.subscribe("ticks:acct:EUR_USD").await.unwrap();
        let mut b = bus.subscribe("ticks:acct:USD_JPY").await.unwrap();

        for i in 0..3 {
            bus.publish("ticks:acct:EUR_USD", &i.to_string()).await.unwrap();
        }
        bus.publish("ticks:acct:USD_JPY", "jpy").await.unwrap();

        let received: Vec<String> = (&mut a).take(3).collect().await;
        assert_eq!(received, vec!["0", "1", "2"]);
        assert_eq!(b.next().await.as_deref(), Some("jpy"));
    }

    #[tokio::test]
    async fn close_ends_streams() {
        let bus = MemoryBus::default();
        let mut sub = bus.subscribe("c").await.unwrap();
        assert_eq!(bus.subscriber_count("c"), 1);
        bus.close();
        assert!(sub.next().await.is_none());
    }
}
