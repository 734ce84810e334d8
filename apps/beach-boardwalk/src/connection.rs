use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::ServerMessage;

pub type ConnectionId = Uuid;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("outbound buffer full")]
    Full,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Shared handle to one accepted socket.
///
/// The registry and the heartbeat monitor hold clones; the socket task owns
/// the receiving half of the outbound channel and watches the close token.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: ConnectionId,
    outbound: mpsc::Sender<Message>,
    alive: AtomicBool,
    closer: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                outbound,
                alive: AtomicBool::new(true),
                closer: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn is_open(&self) -> bool {
        !self.inner.outbound.is_closed() && !self.inner.closer.is_cancelled()
    }

    pub fn send(&self, message: &ServerMessage) -> Result<(), SendError> {
        let json = serde_json::to_string(message)?;
        self.send_frame(Message::Text(json))
    }

    pub fn send_frame(&self, frame: Message) -> Result<(), SendError> {
        if self.inner.closer.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.inner.outbound.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub fn mark_alive(&self) {
        self.inner.alive.store(true, Ordering::Release);
    }

    /// Clears the liveness flag, returning whether it was set.
    pub fn take_alive(&self) -> bool {
        self.inner.alive.swap(false, Ordering::AcqRel)
    }

    /// Forcibly ends the connection; the socket task then runs its
    /// disconnect cleanup.
    pub fn terminate(&self) {
        self.inner.closer.cancel();
    }

    pub fn closed(&self) -> CancellationToken {
        self.inner.closer.clone()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Handle wired to an in-test receiver instead of a socket.
    pub fn handle(buffer: usize) -> (ConnectionHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(buffer);
        (ConnectionHandle::new(Uuid::new_v4(), tx), rx)
    }

    /// Decodes every queued text frame without waiting.
    pub fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Message::Text(text) = frame {
                out.push(serde_json::from_str(&text).expect("server message"));
            }
        }
        out
    }
}
