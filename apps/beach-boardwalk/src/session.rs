use std::sync::Arc;

use metrics::counter;
use tracing::{debug, info, warn};
use transport_bus::Bus;

use crate::bridge::PubSubBridge;
use crate::connection::ConnectionHandle;
use crate::protocol::{ClientMessage, Presence, ProtocolError, RoomId, ServerMessage};
use crate::registry::Registry;

/// Room membership state of one connection.
///
/// A connection is in at most one room at a time. Frames are applied strictly
/// in the order they are handed in; once [`RoomSession::disconnect`] consumes
/// the session no further transitions are possible.
pub struct RoomSession<B: Bus> {
    conn: ConnectionHandle,
    current_room: Option<RoomId>,
    registry: Registry,
    bridge: Arc<PubSubBridge<B>>,
}

impl<B: Bus + 'static> RoomSession<B> {
    pub fn new(conn: ConnectionHandle, registry: Registry, bridge: Arc<PubSubBridge<B>>) -> Self {
        Self {
            conn,
            current_room: None,
            registry,
            bridge,
        }
    }

    pub fn current_room(&self) -> Option<&str> {
        self.current_room.as_deref()
    }

    /// Decodes and applies one raw client frame.
    pub async fn handle_frame(&mut self, raw: &str) {
        let result = match ClientMessage::decode(raw) {
            Ok(message) => self.handle_message(message).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            self.reject(err);
        }
    }

    /// Binary frames carry the same JSON as text frames.
    pub async fn handle_binary(&mut self, raw: &[u8]) {
        match std::str::from_utf8(raw) {
            Ok(text) => self.handle_frame(text).await,
            Err(_) => self.reject(ProtocolError::InvalidJson),
        }
    }

    pub async fn handle_message(&mut self, message: ClientMessage) -> Result<(), ProtocolError> {
        match message {
            ClientMessage::Join { room } => self.join(room).await,
            ClientMessage::Chat { text } => self.chat(text).await,
            ClientMessage::Leave => {
                self.leave().await;
                Ok(())
            }
        }
    }

    async fn join(&mut self, room: RoomId) -> Result<(), ProtocolError> {
        if self.current_room.is_some() {
            self.leave().await;
        }

        self.registry.add(&room, self.conn.clone());
        if let Err(err) = self.bridge.ensure_subscribed(&room).await {
            warn!(
                connection_id = %self.conn.id(),
                %room,
                error = %err,
                "room subscription failed; rolling back join"
            );
            self.registry.remove(&room, self.conn.id());
            return Err(ProtocolError::JoinFailed);
        }
        self.current_room = Some(room.clone());
        info!(connection_id = %self.conn.id(), %room, "joined room");

        self.send(&ServerMessage::joined_ack(&room));
        self.announce(&room, Presence::Joined).await;
        Ok(())
    }

    async fn chat(&mut self, text: String) -> Result<(), ProtocolError> {
        let Some(room) = self.current_room.as_deref() else {
            return Err(ProtocolError::NotJoined);
        };
        if let Err(err) = self.bridge.publish_chat(room, text).await {
            warn!(connection_id = %self.conn.id(), %room, error = %err, "failed to publish chat");
        }
        Ok(())
    }

    async fn leave(&mut self) {
        let Some(room) = self.current_room.take() else {
            return;
        };
        self.registry.remove(&room, self.conn.id());
        info!(connection_id = %self.conn.id(), %room, "left room");
        self.announce(&room, Presence::Left).await;
    }

    /// Socket closed or terminated: same cleanup as an explicit leave.
    pub async fn disconnect(mut self) {
        self.leave().await;
    }

    async fn announce(&self, room: &str, presence: Presence) {
        if let Err(err) = self.bridge.publish_presence(room, presence).await {
            warn!(
                connection_id = %self.conn.id(),
                %room,
                presence = presence.as_str(),
                error = %err,
                "failed to publish presence notice"
            );
        }
    }

    fn reject(&self, err: ProtocolError) {
        counter!("boardwalk_protocol_errors_total", 1, "reason" => err.metric_label());
        debug!(connection_id = %self.conn.id(), error = %err, "rejecting client frame");
        self.send(&ServerMessage::error(&err));
    }

    fn send(&self, message: &ServerMessage) {
        if let Err(err) = self.conn.send(message) {
            debug!(connection_id = %self.conn.id(), error = %err, "dropping outbound message");
        }
    }
}
