//! Topic-based message bus shared by relay instances.
//!
//! A [`Bus`] publishes payloads to named topics and subscribes its single
//! inbound channel to topics on request. Deliveries for every subscribed topic
//! arrive on the [`BusInbox`] handed out when the bus is created, so one
//! consumer task can drain them in arrival order.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

mod local;
mod redis_bus;

pub use local::{LocalBus, LocalBusClient};
pub use redis_bus::RedisBus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        BusError::Transport(err.to_string())
    }
}

pub type BusResult<T> = Result<T, BusError>;

/// Receiving half of a bus connection.
pub type BusInbox = mpsc::UnboundedReceiver<BusMessage>;

#[async_trait]
pub trait Bus: Send + Sync {
    /// Routes deliveries for `topic` to this bus's inbox.
    async fn subscribe(&self, topic: &str) -> BusResult<()>;

    /// Sends `payload` to every inbox subscribed to `topic`. Succeeds even when
    /// nobody is listening.
    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
}
