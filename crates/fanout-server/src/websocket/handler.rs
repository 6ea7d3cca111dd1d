//! Per-connection protocol state machine.

use std::sync::Arc;
use std::time::Duration;

use fanout_core::protocol::{self, ClientRequest, Envelope};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::connection::Connection;
use super::heartbeat::run_heartbeat;
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};
use crate::registry::ConnectionRegistry;

/// Drives one connection: registration, heartbeat, requests, teardown.
pub struct ProtocolHandler {
    conn: Arc<Connection>,
    registry: Arc<ConnectionRegistry>,
    heartbeat_interval: Duration,
}

impl ProtocolHandler {
    /// Handler for `conn`.
    pub fn new(
        conn: Arc<Connection>,
        registry: Arc<ConnectionRegistry>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            conn,
            registry,
            heartbeat_interval,
        }
    }

    /// Register the connection, then process requests one at a time until
    /// the connection closes or `shutdown` fires. Always tears down.
    pub async fn run(self, mut inbound: mpsc::Receiver<Envelope>, shutdown: CancellationToken) {
        self.registry.add_connection(Arc::clone(&self.conn));
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        info!(
            conn_id = %self.conn.id(),
            shard = self.registry.route(self.conn.id()),
            "connection opened"
        );

        let heartbeat = tokio::spawn(run_heartbeat(
            Arc::clone(&self.conn),
            self.heartbeat_interval,
        ));

        loop {
            tokio::select! {
                biased;
                () = self.conn.closed() => break,
                () = shutdown.cancelled() => break,
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => self.handle(&envelope),
                    None => break,
                },
            }
        }

        self.teardown();
        // Ends on its own once the connection is closed.
        let _ = heartbeat.await;
    }

    /// Process one decoded envelope.
    pub fn handle(&self, envelope: &Envelope) {
        match ClientRequest::from_envelope(envelope) {
            Ok(Some(request)) => self.handle_request(request),
            Ok(None) => debug!(conn_id = %self.conn.id(), kind = %envelope.kind, "ignoring unknown message type"),
            Err(e) => debug!(conn_id = %self.conn.id(), error = %e, "ignoring malformed request"),
        }
    }

    fn handle_request(&self, request: ClientRequest) {
        match request {
            ClientRequest::Ping => self.ping(),
            ClientRequest::Join { room } => self.join(room),
            ClientRequest::Leave { room } => self.leave(&room),
        }
    }

    fn ping(&self) {
        self.conn.keep_alive();
        if let Err(e) = self.conn.send_message(protocol::encode_pong()) {
            debug!(conn_id = %self.conn.id(), error = %e, "failed to queue pong");
        }
    }

    fn join(&self, room: String) {
        let id = self.conn.id();
        if self.conn.room_count() >= self.conn.max_rooms() {
            debug!(conn_id = %id, room, max = self.conn.max_rooms(), "room cap reached, ignoring join");
            return;
        }
        if self.conn.is_member(&room) {
            debug!(conn_id = %id, room, "already joined, ignoring");
            return;
        }
        match self.registry.join_room(&room, id) {
            Ok(()) => {
                debug!(conn_id = %id, room, "joined room");
                let _ = self.conn.record_join(room);
            }
            Err(e) => debug!(conn_id = %id, room, error = %e, "join ignored"),
        }
    }

    fn leave(&self, room: &str) {
        let id = self.conn.id();
        if !self.conn.is_member(room) {
            debug!(conn_id = %id, room, "not a member, ignoring leave");
            return;
        }
        if let Err(e) = self.registry.leave_room(room, id) {
            debug!(conn_id = %id, room, error = %e, "leave ignored");
        }
        let _ = self.conn.record_leave(room);
    }

    /// Close the connection, leave every joined room, then deregister it.
    ///
    /// Safe to call more than once; cleanup only happens the first time.
    pub fn teardown(&self) {
        let id = self.conn.id();
        let _ = self.conn.close();
        let rooms = self.conn.take_rooms();
        for room in &rooms {
            if let Err(e) = self.registry.leave_room(room, id) {
                debug!(conn_id = %id, room, error = %e, "leave during teardown failed");
            }
        }
        if self.registry.shard_for(id).remove_connection(id).is_some() {
            counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
            gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
            info!(
                conn_id = %id,
                rooms_left = rooms.len(),
                dropped = self.conn.dropped_count(),
                "connection closed"
            );
        }
    }
}
