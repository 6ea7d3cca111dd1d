//! Error taxonomy for the fan-out tier.
//!
//! Saturation errors (`*QueueFull`) mean "this unit of work was dropped".
//! They are reported to the immediate caller and never escalate beyond it.

use thiserror::Error;

/// Failure to enqueue a frame on one connection's outbound queue.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The connection has already been closed.
    #[error("connection closed")]
    ConnectionClosed,
    /// The writer cannot keep up; the frame was dropped for this connection.
    #[error("outbound queue full")]
    OutboundQueueFull,
}

/// Failures surfaced by the connection registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The connection is already registered in the room.
    #[error("already a member of room '{room}'")]
    AlreadyMember {
        /// Room name.
        room: String,
    },
    /// The connection is not registered in the room.
    #[error("not a member of room '{room}'")]
    NotAMember {
        /// Room name.
        room: String,
    },
    /// The dispatch queue is saturated; the push was dropped.
    #[error("dispatch queue full")]
    DispatchQueueFull,
    /// The registry has been shut down.
    #[error("registry shut down")]
    ShutDown,
}

/// Failures surfaced by the merge layer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MergeError {
    /// The destination worker's input queue is saturated; the item was dropped.
    #[error("merge queue full")]
    MergeQueueFull,
    /// The merge layer has been shut down.
    #[error("merge layer shut down")]
    ShutDown,
}

/// Failures decoding client frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not a JSON object with a string `type`.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[from] serde_json::Error),
    /// A membership request carried no usable room name.
    #[error("{kind} request is missing a room")]
    MissingRoom {
        /// Request type (`JOIN` or `LEAVE`).
        kind: &'static str,
    },
    /// A membership request's `data` had the wrong shape.
    #[error("malformed {kind} data: {source}")]
    MalformedData {
        /// Request type (`JOIN` or `LEAVE`).
        kind: &'static str,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },
}

impl ProtocolError {
    /// Whether this error is fatal to the connection.
    ///
    /// Only an undecodable envelope closes the connection; a bad membership
    /// request is ignored and the connection stays open.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidEnvelope(_))
    }
}
