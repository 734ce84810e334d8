use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use transport_bus::Bus;
use uuid::Uuid;

use crate::bridge::PubSubBridge;
use crate::connection::ConnectionHandle;
use crate::heartbeat::HeartbeatMonitor;
use crate::registry::Registry;
use crate::session::RoomSession;

/// Everything one relay instance shares between its connections.
pub struct AppState<B: Bus> {
    pub registry: Registry,
    pub bridge: Arc<PubSubBridge<B>>,
    pub heartbeat: HeartbeatMonitor,
    pub outbound_buffer: usize,
    pub metrics: Option<PrometheusHandle>,
}

impl<B: Bus + 'static> AppState<B> {
    pub fn new(bus: Arc<B>, outbound_buffer: usize, metrics: Option<PrometheusHandle>) -> Self {
        let registry = Registry::new();
        Self {
            bridge: Arc::new(PubSubBridge::new(bus, registry.clone())),
            registry,
            heartbeat: HeartbeatMonitor::new(),
            outbound_buffer,
            metrics,
        }
    }

    fn stats(&self) -> StatsResponse {
        let rooms: Vec<RoomStatsEntry> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|snap| RoomStatsEntry {
                room: snap.room,
                members: snap.members,
            })
            .collect();
        StatsResponse {
            active_rooms: rooms.len(),
            active_connections: self.heartbeat.tracked(),
            subscribed_rooms: self.bridge.subscription_count(),
            rooms,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_rooms: usize,
    active_connections: usize,
    subscribed_rooms: usize,
    rooms: Vec<RoomStatsEntry>,
}

#[derive(Debug, Serialize)]
struct RoomStatsEntry {
    room: String,
    members: usize,
}

pub fn router<B: Bus + 'static>(state: Arc<AppState<B>>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler::<B>))
        .route("/metrics", get(metrics_handler::<B>))
        .route("/ws", get(ws_handler::<B>))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler<B: Bus + 'static>(State(state): State<Arc<AppState<B>>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler<B: Bus + 'static>(
    State(state): State<Arc<AppState<B>>>,
) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn ws_handler<B: Bus + 'static>(
    State(state): State<Arc<AppState<B>>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket<B: Bus + 'static>(socket: WebSocket, state: Arc<AppState<B>>) {
    let connection_id = Uuid::new_v4();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.outbound_buffer);
    let conn = ConnectionHandle::new(connection_id, tx);

    state.heartbeat.track(conn.clone());
    counter!("boardwalk_connections_total", 1);
    info!(%connection_id, "connection established");

    let writer_closed = conn.closed();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_closed.cancelled() => break,
                next = rx.recv() => match next {
                    Some(frame) => {
                        if ws_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        debug!(%connection_id, "writer task finished");
    });

    let mut session = RoomSession::new(conn.clone(), state.registry.clone(), Arc::clone(&state.bridge));
    let closed = conn.closed();
    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => {
                info!(%connection_id, "connection terminated");
                break;
            }
            next = ws_rx.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => session.handle_frame(&text).await,
            Some(Ok(Message::Binary(bytes))) => session.handle_binary(&bytes).await,
            Some(Ok(Message::Pong(_))) => conn.mark_alive(),
            Some(Ok(Message::Ping(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                debug!(
                    %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Some(Err(err)) => {
                warn!(%connection_id, error = %err, "error receiving message");
                break;
            }
            None => break,
        }
    }

    debug!(%connection_id, room = ?session.current_room(), "cleaning up connection");
    session.disconnect().await;
    state.heartbeat.untrack(connection_id);
    conn.terminate();
    join_writer(connection_id, writer).await;

    info!(%connection_id, "connection closed");
}

/// Waits for a connection's writer task, reporting a panic or cancellation.
/// Returns whether the writer finished cleanly.
async fn join_writer(connection_id: Uuid, writer: JoinHandle<()>) -> bool {
    match writer.await {
        Ok(()) => true,
        Err(err) => {
            warn!(%connection_id, error = %err, panicked = err.is_panic(), "writer task failed");
            false
        }
    }
}
