//! One partition of the connection and room space.

use std::collections::HashMap;
use std::sync::Arc;

use fanout_core::errors::{RegistryError, SendError};
use fanout_core::ids::ConnectionId;
use fanout_core::protocol::Frame;
use metrics::counter;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::room::Room;
use crate::metrics::WS_OUTBOUND_DROPS_TOTAL;
use crate::websocket::connection::Connection;

#[derive(Default)]
struct ShardTables {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    rooms: HashMap<String, Room>,
}

/// A disjoint partition of connections and the rooms that contain them.
///
/// One lock guards both tables. Broadcasts take it shared, membership
/// changes take it exclusive; it is never held across an await.
pub struct Shard {
    index: usize,
    tables: RwLock<ShardTables>,
}

impl Shard {
    /// Empty shard.
    pub fn new(index: usize) -> Self {
        Self {
            index,
            tables: RwLock::new(ShardTables::default()),
        }
    }

    /// Position of this shard in the registry.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Take ownership of a connection.
    pub fn add_connection(&self, conn: Arc<Connection>) {
        let mut tables = self.tables.write();
        let _ = tables.connections.insert(conn.id(), conn);
    }

    /// Drop a connection. Removing an absent connection is a no-op.
    pub fn remove_connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.tables.write().connections.remove(&id)
    }

    /// Add `id` to room `name`, creating the room if needed.
    pub fn join_room(&self, name: &str, id: ConnectionId) -> Result<(), RegistryError> {
        let mut tables = self.tables.write();
        let room = tables
            .rooms
            .entry(name.to_owned())
            .or_default();
        if room.insert(id) {
            Ok(())
        } else {
            Err(RegistryError::AlreadyMember {
                room: name.to_owned(),
            })
        }
    }

    /// Remove `id` from room `name`, dropping the room once it is empty.
    pub fn leave_room(&self, name: &str, id: ConnectionId) -> Result<(), RegistryError> {
        let mut tables = self.tables.write();
        let Some(room) = tables.rooms.get_mut(name) else {
            return Err(RegistryError::NotAMember {
                room: name.to_owned(),
            });
        };
        if !room.remove(id) {
            return Err(RegistryError::NotAMember {
                room: name.to_owned(),
            });
        }
        if room.is_empty() {
            let _ = tables.rooms.remove(name);
        }
        Ok(())
    }

    /// Offer `frame` to every connection in this shard.
    ///
    /// Returns how many connections accepted it.
    pub fn broadcast_all(&self, frame: &Frame) -> usize {
        let tables = self.tables.read();
        let delivered = tables
            .connections
            .values()
            .filter(|conn| self.deliver(conn, frame))
            .count();
        debug!(
            shard = self.index,
            recipients = tables.connections.len(),
            delivered,
            "broadcast to shard"
        );
        delivered
    }

    /// Offer `frame` to the members of room `name` in this shard.
    ///
    /// No-op if the room has no members here.
    pub fn broadcast_room(&self, name: &str, frame: &Frame) -> usize {
        let tables = self.tables.read();
        let Some(room) = tables.rooms.get(name) else {
            return 0;
        };
        let delivered = room
            .members()
            .filter_map(|id| tables.connections.get(&id))
            .filter(|conn| self.deliver(conn, frame))
            .count();
        debug!(
            shard = self.index,
            room = name,
            recipients = room.len(),
            delivered,
            "broadcast to room"
        );
        delivered
    }

    fn deliver(&self, conn: &Connection, frame: &Frame) -> bool {
        match conn.send_message(Arc::clone(frame)) {
            Ok(()) => true,
            Err(SendError::OutboundQueueFull) => {
                counter!(WS_OUTBOUND_DROPS_TOTAL).increment(1);
                warn!(conn_id = %conn.id(), shard = self.index, "outbound queue full, dropping frame");
                false
            }
            Err(SendError::ConnectionClosed) => {
                debug!(conn_id = %conn.id(), shard = self.index, "skipping closed connection");
                false
            }
        }
    }

    /// Connections owned by this shard.
    pub fn connection_count(&self) -> usize {
        self.tables.read().connections.len()
    }

    /// Rooms with at least one member in this shard.
    pub fn room_count(&self) -> usize {
        self.tables.read().rooms.len()
    }

    /// Members of room `name` in this shard.
    pub fn room_member_count(&self, name: &str) -> usize {
        self.tables.read().rooms.get(name).map_or(0, Room::len)
    }

    #[cfg(test)]
    fn has_room(&self, name: &str) -> bool {
        self.tables.read().rooms.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::{ConnectionLimits, ConnectionQueues};

    fn make_connection(id: u64, out: usize) -> (Arc<Connection>, ConnectionQueues) {
        let limits = ConnectionLimits {
            in_channel_size: 4,
            out_channel_size: out,
            max_rooms: 5,
        };
        let (conn, queues) = Connection::new(ConnectionId::new(id), &limits);
        (Arc::new(conn), queues)
    }

    fn frame(text: &str) -> Frame {
        Arc::new(text.to_owned())
    }

    #[test]
    fn add_and_remove_connection() {
        let shard = Shard::new(0);
        let (conn, _q) = make_connection(1, 4);
        shard.add_connection(conn);
        assert_eq!(shard.connection_count(), 1);

        assert!(shard.remove_connection(ConnectionId::new(1)).is_some());
        assert!(shard.remove_connection(ConnectionId::new(1)).is_none());
        assert_eq!(shard.connection_count(), 0);
    }

    #[test]
    fn room_exists_only_while_it_has_members() {
        let shard = Shard::new(3);
        let a = ConnectionId::new(1);
        let b = ConnectionId::new(2);
        assert!(!shard.has_room("lobby"));

        shard.join_room("lobby", a).unwrap();
        shard.join_room("lobby", b).unwrap();
        assert_eq!(shard.room_member_count("lobby"), 2);

        shard.leave_room("lobby", a).unwrap();
        assert!(shard.has_room("lobby"));
        shard.leave_room("lobby", b).unwrap();
        assert!(!shard.has_room("lobby"));
        assert_eq!(shard.room_count(), 0);
    }

    #[test]
    fn duplicate_join_rejected() {
        let shard = Shard::new(0);
        let a = ConnectionId::new(1);
        shard.join_room("lobby", a).unwrap();
        let err = shard.join_room("lobby", a).unwrap_err();
        assert_eq!(
            err,
            RegistryError::AlreadyMember {
                room: "lobby".into()
            }
        );
        assert_eq!(shard.room_member_count("lobby"), 1);
    }

    #[test]
    fn leave_without_membership_rejected() {
        let shard = Shard::new(0);
        let a = ConnectionId::new(1);
        assert!(matches!(
            shard.leave_room("lobby", a),
            Err(RegistryError::NotAMember { .. })
        ));
        shard.join_room("lobby", ConnectionId::new(2)).unwrap();
        assert!(matches!(
            shard.leave_room("lobby", a),
            Err(RegistryError::NotAMember { .. })
        ));
        assert_eq!(shard.room_member_count("lobby"), 1);
    }

    #[test]
    fn broadcast_all_reaches_every_connection() {
        let shard = Shard::new(0);
        let (c1, mut q1) = make_connection(1, 4);
        let (c2, mut q2) = make_connection(2, 4);
        shard.add_connection(c1);
        shard.add_connection(c2);

        assert_eq!(shard.broadcast_all(&frame("hi")), 2);
        assert_eq!(q1.outbound_rx.try_recv().unwrap().as_str(), "hi");
        assert_eq!(q2.outbound_rx.try_recv().unwrap().as_str(), "hi");
    }

    #[test]
    fn broadcast_room_reaches_exactly_current_members() {
        let shard = Shard::new(0);
        let (a, mut qa) = make_connection(1, 4);
        let (b, mut qb) = make_connection(2, 4);
        let (c, mut qc) = make_connection(3, 4);
        for conn in [&a, &b, &c] {
            shard.add_connection(Arc::clone(conn));
        }
        shard.join_room("lobby", a.id()).unwrap();
        shard.join_room("lobby", b.id()).unwrap();

        assert_eq!(shard.broadcast_room("lobby", &frame("one")), 2);
        shard.join_room("lobby", c.id()).unwrap();

        assert_eq!(qa.outbound_rx.try_recv().unwrap().as_str(), "one");
        assert_eq!(qb.outbound_rx.try_recv().unwrap().as_str(), "one");
        assert!(qc.outbound_rx.try_recv().is_err());
    }

    #[test]
    fn broadcast_to_missing_room_is_noop() {
        let shard = Shard::new(0);
        let (a, mut qa) = make_connection(1, 4);
        shard.add_connection(a);
        assert_eq!(shard.broadcast_room("nowhere", &frame("x")), 0);
        assert!(qa.outbound_rx.try_recv().is_err());
    }

    #[test]
    fn full_outbound_queue_does_not_block_other_members() {
        let shard = Shard::new(0);
        let mut queues = Vec::new();
        for id in 0..100 {
            let out = if id == 0 { 1 } else { 4 };
            let (conn, q) = make_connection(id, out);
            shard.join_room("big", conn.id()).unwrap();
            shard.add_connection(conn);
            queues.push(q);
        }
        let slow = shard.tables.read().connections[&ConnectionId::new(0)].clone();
        slow.send_message(frame("backlog")).unwrap();

        assert_eq!(shard.broadcast_room("big", &frame("news")), 99);
        assert_eq!(slow.dropped_count(), 1);
        for q in &mut queues[1..] {
            assert_eq!(q.outbound_rx.try_recv().unwrap().as_str(), "news");
        }
    }

    #[test]
    fn closed_connections_are_skipped() {
        let shard = Shard::new(0);
        let (a, _qa) = make_connection(1, 4);
        let (b, mut qb) = make_connection(2, 4);
        let _ = a.close();
        shard.add_connection(a);
        shard.add_connection(b);
        assert_eq!(shard.broadcast_all(&frame("x")), 1);
        assert!(qb.outbound_rx.try_recv().is_ok());
    }
}
