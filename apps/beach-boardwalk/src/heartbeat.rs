use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connection::{ConnectionHandle, ConnectionId};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub terminated: usize,
}

/// Liveness sweep over every connection held by this instance.
///
/// Each sweep terminates connections that have not answered the previous
/// probe and probes the rest. A dead peer is reclaimed within two intervals.
#[derive(Clone, Default)]
pub struct HeartbeatMonitor {
    connections: Arc<DashMap<ConnectionId, ConnectionHandle>>,
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, conn: ConnectionHandle) {
        self.connections.insert(conn.id(), conn);
        gauge!("boardwalk_connections_active", self.connections.len() as f64);
    }

    pub fn untrack(&self, id: ConnectionId) {
        self.connections.remove(&id);
        gauge!("boardwalk_connections_active", self.connections.len() as f64);
    }

    pub fn tracked(&self) -> usize {
        self.connections.len()
    }

    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let snapshot: Vec<ConnectionHandle> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for conn in snapshot {
            if conn.take_alive() {
                if let Err(err) = conn.send_frame(Message::Ping(Vec::new())) {
                    debug!(connection_id = %conn.id(), error = %err, "failed to queue ping");
                }
                report.probed += 1;
            } else {
                info!(connection_id = %conn.id(), "terminating unresponsive connection");
                self.untrack(conn.id());
                conn.terminate();
                counter!("boardwalk_heartbeat_terminated_total", 1);
                report.terminated += 1;
            }
        }

        report
    }

    /// Runs [`HeartbeatMonitor::sweep`] every `period`, starting one period
    /// from now.
    pub fn spawn(&self, period: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        let mut interval =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let report = monitor.sweep();
                if report.terminated > 0 {
                    debug!(
                        probed = report.probed,
                        terminated = report.terminated,
                        "heartbeat sweep reclaimed connections"
                    );
                }
            }
        })
    }
}
