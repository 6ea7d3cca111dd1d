//! Per-connection state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use fanout_core::errors::SendError;
use fanout_core::ids::ConnectionId;
use fanout_core::protocol::{Envelope, Frame};
use fanout_settings::SocketSettings;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Queue sizes and limits applied to every connection.
#[derive(Clone, Debug)]
pub struct ConnectionLimits {
    /// Inbound (decoded frame) queue capacity.
    pub in_channel_size: usize,
    /// Outbound (frame to write) queue capacity.
    pub out_channel_size: usize,
    /// Maximum number of joined rooms.
    pub max_rooms: usize,
}

impl From<&SocketSettings> for ConnectionLimits {
    fn from(settings: &SocketSettings) -> Self {
        Self {
            in_channel_size: settings.in_channel_size,
            out_channel_size: settings.out_channel_size,
            max_rooms: settings.max_join_room,
        }
    }
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self::from(&SocketSettings::default())
    }
}

/// Queue ends handed to the pumps and the protocol handler.
pub struct ConnectionQueues {
    /// Read pump side of the inbound queue.
    pub inbound_tx: mpsc::Sender<Envelope>,
    /// Protocol handler side of the inbound queue.
    pub inbound_rx: mpsc::Receiver<Envelope>,
    /// Write pump side of the outbound queue.
    pub outbound_rx: mpsc::Receiver<Frame>,
}

/// One persistent client session.
///
/// Owned by exactly one shard (chosen by `id mod shard_count`) for its whole
/// lifetime. Rooms hold only its [`ConnectionId`].
pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::Sender<Frame>,
    closed: AtomicBool,
    close_token: CancellationToken,
    last_heartbeat: Mutex<Instant>,
    rooms: Mutex<HashSet<String>>,
    max_rooms: usize,
    dropped_messages: AtomicU64,
}

impl Connection {
    /// Create a connection and its queues.
    pub fn new(id: ConnectionId, limits: &ConnectionLimits) -> (Self, ConnectionQueues) {
        let (inbound_tx, inbound_rx) = mpsc::channel(limits.in_channel_size);
        let (outbound, outbound_rx) = mpsc::channel(limits.out_channel_size);
        let conn = Self {
            id,
            outbound,
            closed: AtomicBool::new(false),
            close_token: CancellationToken::new(),
            last_heartbeat: Mutex::new(Instant::now()),
            rooms: Mutex::new(HashSet::new()),
            max_rooms: limits.max_rooms,
            dropped_messages: AtomicU64::new(0),
        };
        let queues = ConnectionQueues {
            inbound_tx,
            inbound_rx,
            outbound_rx,
        };
        (conn, queues)
    }

    /// Connection identity.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueue a frame for the write pump without waiting.
    ///
    /// A full queue drops the frame for this connection only and counts it.
    pub fn send_message(&self, frame: Frame) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::ConnectionClosed);
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(SendError::OutboundQueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(SendError::ConnectionClosed),
        }
    }

    /// Close the connection. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.close_token.cancel();
        true
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.close_token.cancelled()
    }

    /// Refresh the heartbeat timestamp.
    pub fn keep_alive(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Not closed, and the last heartbeat is no older than `interval`.
    pub fn is_alive(&self, interval: Duration) -> bool {
        !self.is_closed() && self.last_heartbeat.lock().elapsed() <= interval
    }

    /// Maximum number of rooms this connection may join.
    pub fn max_rooms(&self) -> usize {
        self.max_rooms
    }

    /// Number of joined rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    /// Whether the connection has joined `room`.
    pub fn is_member(&self, room: &str) -> bool {
        self.rooms.lock().contains(room)
    }

    /// Record a successful join.
    pub fn record_join(&self, room: String) -> bool {
        self.rooms.lock().insert(room)
    }

    /// Record a leave.
    pub fn record_leave(&self, room: &str) -> bool {
        self.rooms.lock().remove(room)
    }

    /// Remove and return every joined room.
    pub fn take_rooms(&self) -> Vec<String> {
        self.rooms.lock().drain().collect()
    }

    /// Frames dropped because the outbound queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}
