use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type RoomId = String;

/// Messages sent from a client to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Join { room: RoomId },
    Chat { text: String },
    Leave,
}

/// Wire shape of [`ClientMessage`]; required fields are checked after decoding
/// so each missing field gets its own error.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Join {
        #[serde(default)]
        room: Option<String>,
        #[serde(default, rename = "roomId")]
        room_id: Option<String>,
    },
    Chat {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    Leave,
}

const KNOWN_TYPES: [&str; 3] = ["join", "chat", "leave"];

/// Client input the relay refuses. Answered with an `error` frame; the
/// connection stays in whatever state it was in.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON")]
    InvalidJson,
    #[error("Unknown message type")]
    UnknownType,
    #[error("room is required")]
    MissingRoom,
    #[error("text is required")]
    MissingText,
    #[error("Invalid message: {0}")]
    Malformed(String),
    #[error("Join a room first")]
    NotJoined,
    #[error("Failed to join room")]
    JoinFailed,
}

impl ProtocolError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ProtocolError::InvalidJson => "invalid_json",
            ProtocolError::UnknownType => "unknown_type",
            ProtocolError::MissingRoom => "missing_room",
            ProtocolError::MissingText => "missing_text",
            ProtocolError::Malformed(_) => "malformed",
            ProtocolError::NotJoined => "not_joined",
            ProtocolError::JoinFailed => "join_failed",
        }
    }
}

impl ClientMessage {
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw).map_err(|_| ProtocolError::InvalidJson)?;

        let known = value
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|kind| KNOWN_TYPES.contains(&kind));
        if !known {
            return Err(ProtocolError::UnknownType);
        }

        let frame: ClientFrame = serde_json::from_value(value)
            .map_err(|err| ProtocolError::Malformed(err.to_string()))?;

        match frame {
            ClientFrame::Join { room, room_id } => first_non_empty(room, room_id)
                .map(|room| ClientMessage::Join { room })
                .ok_or(ProtocolError::MissingRoom),
            ClientFrame::Chat { text, message } => first_non_empty(text, message)
                .map(|text| ClientMessage::Chat { text })
                .ok_or(ProtocolError::MissingText),
            ClientFrame::Leave => Ok(ClientMessage::Leave),
        }
    }
}

/// Either spelling of a field may be sent; the primary one wins unless empty.
fn first_non_empty(primary: Option<String>, fallback: Option<String>) -> Option<String> {
    primary
        .filter(|value| !value.is_empty())
        .or_else(|| fallback.filter(|value| !value.is_empty()))
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    System {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<RoomId>,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<u64>,
    },
    Chat {
        room: RoomId,
        text: String,
        ts: u64,
    },
    Error {
        error: String,
    },
}

impl ServerMessage {
    pub fn joined_ack(room: &str) -> Self {
        ServerMessage::System {
            room: None,
            text: format!("Joined room {room}"),
            ts: None,
        }
    }

    pub fn error(err: &ProtocolError) -> Self {
        ServerMessage::Error {
            error: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Joined,
    Left,
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Joined => "joined",
            Presence::Left => "left",
        }
    }
}

/// Payload carried on a room's broker topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    System { room: RoomId, text: String, ts: u64 },
    Chat { room: RoomId, text: String, ts: u64 },
}

impl RoomEvent {
    pub fn presence(room: &str, presence: Presence) -> Self {
        RoomEvent::System {
            room: room.to_string(),
            text: format!("A user {} room {room}", presence.as_str()),
            ts: now_millis(),
        }
    }

    pub fn chat(room: &str, text: String) -> Self {
        RoomEvent::Chat {
            room: room.to_string(),
            text,
            ts: now_millis(),
        }
    }

    pub fn room(&self) -> &str {
        match self {
            RoomEvent::System { room, .. } | RoomEvent::Chat { room, .. } => room,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RoomEvent::System { .. } => "system",
            RoomEvent::Chat { .. } => "chat",
        }
    }
}

impl From<RoomEvent> for ServerMessage {
    fn from(event: RoomEvent) -> Self {
        match event {
            RoomEvent::System { room, text, ts } => ServerMessage::System {
                room: Some(room),
                text,
                ts: Some(ts),
            },
            RoomEvent::Chat { room, text, ts } => ServerMessage::Chat { room, text, ts },
        }
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
