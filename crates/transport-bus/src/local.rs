use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{Bus, BusInbox, BusMessage, BusResult};

/// In-memory broker for tests and single-process deployments.
///
/// Each [`LocalBusClient`] obtained from [`LocalBus::connect`] behaves like a
/// separate broker connection: it owns one inbox, and every `subscribe` call
/// adds a delivery route for that inbox. Subscribing the same client twice
/// therefore delivers each publish twice, which keeps redundant subscribes
/// visible to callers that are supposed to deduplicate them.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    routes: Arc<parking_lot::RwLock<HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> (LocalBusClient, BusInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            LocalBusClient {
                hub: self.clone(),
                inbox: tx,
            },
            rx,
        )
    }

    /// Number of live delivery routes registered for `topic`.
    pub fn route_count(&self, topic: &str) -> usize {
        self.routes
            .read()
            .get(topic)
            .map(|routes| routes.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn deliver(&self, topic: &str, payload: Bytes) {
        let mut guard = self.routes.write();
        let Some(routes) = guard.get_mut(topic) else {
            return;
        };
        routes.retain(|tx| {
            tx.send(BusMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            })
            .is_ok()
        });
        if routes.is_empty() {
            guard.remove(topic);
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalBusClient {
    hub: LocalBus,
    inbox: mpsc::UnboundedSender<BusMessage>,
}

#[async_trait]
impl Bus for LocalBusClient {
    async fn subscribe(&self, topic: &str) -> BusResult<()> {
        self.hub
            .routes
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(self.inbox.clone());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        self.hub.deliver(topic, payload);
        Ok(())
    }
}
