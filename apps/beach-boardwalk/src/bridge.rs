use std::sync::Arc;

use axum::extract::ws::Message;
use bytes::Bytes;
use dashmap::DashMap;
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use transport_bus::{Bus, BusError, BusInbox, BusMessage};

use crate::connection::SendError;
use crate::protocol::{Presence, RoomEvent, ServerMessage};
use crate::registry::Registry;

const TOPIC_PREFIX: &str = "room:";

pub fn room_topic(room: &str) -> String {
    format!("{TOPIC_PREFIX}{room}")
}

pub fn room_from_topic(topic: &str) -> Option<&str> {
    topic.strip_prefix(TOPIC_PREFIX)
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to encode room event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Why an inbound broker delivery was dropped before fanout.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("topic {0:?} is not a room topic")]
    UnknownTopic(String),
    #[error("payload is not valid utf-8")]
    NotUtf8,
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub skipped_closed: usize,
    pub dropped: usize,
}

/// Relays room events between this instance and the shared broker.
///
/// Outbound: room events are published on the room's topic. Inbound: every
/// delivery on a subscribed topic is fanned out to the local members of that
/// room, including the connection that originally sent it.
pub struct PubSubBridge<B: Bus> {
    bus: Arc<B>,
    registry: Registry,
    subscriptions: DashMap<String, Arc<OnceCell<()>>>,
}

impl<B: Bus + 'static> PubSubBridge<B> {
    pub fn new(bus: Arc<B>, registry: Registry) -> Self {
        Self {
            bus,
            registry,
            subscriptions: DashMap::new(),
        }
    }

    /// Subscribes the inbound channel to `room` once per process lifetime.
    ///
    /// Concurrent callers for the same room wait on the same subscribe. A
    /// failed attempt leaves the room unsubscribed so the next call retries.
    /// Rooms stay subscribed after their last local member leaves.
    pub async fn ensure_subscribed(&self, room: &str) -> Result<(), BusError> {
        let cell = self
            .subscriptions
            .entry(room.to_string())
            .or_default()
            .clone();

        cell.get_or_try_init(|| async {
            let topic = room_topic(room);
            self.bus.subscribe(&topic).await?;
            counter!("boardwalk_subscriptions_total", 1);
            info!(%room, %topic, "subscribed to room topic");
            Ok::<(), BusError>(())
        })
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub fn is_subscribed(&self, room: &str) -> bool {
        self.subscriptions
            .get(room)
            .is_some_and(|cell| cell.initialized())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub async fn publish(&self, event: &RoomEvent) -> Result<(), BridgeError> {
        let topic = room_topic(event.room());
        let payload = serde_json::to_vec(event)?;
        match self.bus.publish(&topic, Bytes::from(payload)).await {
            Ok(()) => {
                counter!("boardwalk_published_total", 1, "kind" => event.kind());
                Ok(())
            }
            Err(err) => {
                counter!("boardwalk_publish_failures_total", 1, "kind" => event.kind());
                Err(err.into())
            }
        }
    }

    pub async fn publish_presence(&self, room: &str, presence: Presence) -> Result<(), BridgeError> {
        self.publish(&RoomEvent::presence(room, presence)).await
    }

    pub async fn publish_chat(&self, room: &str, text: String) -> Result<(), BridgeError> {
        self.publish(&RoomEvent::chat(room, text)).await
    }

    /// Fans one broker delivery out to the local members of its room.
    pub fn deliver(&self, message: &BusMessage) -> Result<Delivery, DeliveryError> {
        let room = room_from_topic(&message.topic)
            .ok_or_else(|| DeliveryError::UnknownTopic(message.topic.clone()))?;
        let text = std::str::from_utf8(&message.payload).map_err(|_| DeliveryError::NotUtf8)?;
        let event: RoomEvent = serde_json::from_str(text)?;

        let mut delivery = Delivery::default();
        let members = self.registry.members_of(room);
        if members.is_empty() {
            return Ok(delivery);
        }

        let frame = serde_json::to_string(&ServerMessage::from(event))?;
        for member in members {
            if !member.is_open() {
                delivery.skipped_closed += 1;
                continue;
            }
            match member.send_frame(Message::Text(frame.clone())) {
                Ok(()) => delivery.delivered += 1,
                Err(SendError::Full) => {
                    delivery.dropped += 1;
                    warn!(%room, connection_id = %member.id(), "outbound buffer full; dropping room event");
                }
                Err(_) => delivery.skipped_closed += 1,
            }
        }

        counter!("boardwalk_delivered_total", delivery.delivered as u64);
        if delivery.dropped > 0 {
            counter!("boardwalk_dropped_total", delivery.dropped as u64);
        }
        Ok(delivery)
    }

    /// Drains the bus inbox until the broker connection goes away.
    pub async fn run_inbound(self: Arc<Self>, mut inbox: BusInbox) {
        while let Some(message) = inbox.recv().await {
            match self.deliver(&message) {
                Ok(delivery) => debug!(
                    topic = %message.topic,
                    delivered = delivery.delivered,
                    skipped = delivery.skipped_closed,
                    dropped = delivery.dropped,
                    "fanned out room event"
                ),
                Err(err) => {
                    counter!("boardwalk_malformed_deliveries_total", 1);
                    debug!(topic = %message.topic, error = %err, "dropping broker delivery");
                }
            }
            gauge!("boardwalk_rooms_active", self.registry.room_count() as f64);
        }
        warn!("bus inbox closed; inbound fanout stopped");
    }
}
