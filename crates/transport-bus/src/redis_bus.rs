use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink};
use redis::{AsyncCommands, Client};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::{Bus, BusInbox, BusMessage, BusResult};

/// Redis pub/sub backed bus.
///
/// Publishes go through a shared [`ConnectionManager`]; subscriptions live on a
/// dedicated pub/sub connection whose message stream is pumped into the inbox.
/// The inbox closes when that connection drops, and the pub/sub connection is
/// not re-established.
#[derive(Clone)]
pub struct RedisBus {
    publisher: ConnectionManager,
    subscriber: std::sync::Arc<Mutex<PubSubSink>>,
}

impl RedisBus {
    pub async fn connect(redis_url: &str) -> BusResult<(Self, BusInbox)> {
        let client = Client::open(redis_url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        let (sink, mut stream) = client.get_async_pubsub().await?.split();

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let message = BusMessage {
                    topic: msg.get_channel_name().to_string(),
                    payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
                };
                if tx.send(message).is_err() {
                    debug!("bus inbox dropped; stopping redis pubsub pump");
                    return;
                }
            }
            warn!("redis pubsub stream ended");
        });

        Ok((
            Self {
                publisher,
                subscriber: std::sync::Arc::new(Mutex::new(sink)),
            },
            rx,
        ))
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn subscribe(&self, topic: &str) -> BusResult<()> {
        let mut sink = self.subscriber.lock().await;
        sink.subscribe(topic).await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn.publish(topic, payload.as_ref()).await?;
        debug!(%topic, receivers, "published to redis");
        Ok(())
    }
}
