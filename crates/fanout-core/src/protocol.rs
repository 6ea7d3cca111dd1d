//! Client wire protocol.
//!
//! Every frame in either direction is a JSON envelope `{"type": ..., "data": ...}`.
//!
//! | type  | direction       | data              |
//! |-------|-----------------|-------------------|
//! | PING  | client → server | `{}`              |
//! | PONG  | server → client | `{}`              |
//! | JOIN  | client → server | `{"room": "..."}` |
//! | LEAVE | client → server | `{"room": "..."}` |
//! | PUSH  | server → client | `{"items": [...]}`|
//!
//! Push items are opaque JSON fragments. They are carried as [`RawValue`]s
//! so they reach the client byte-for-byte as the publisher sent them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::errors::ProtocolError;

/// A pre-serialized text frame, shared between every recipient of a push.
pub type Frame = Arc<String>;

/// Envelope `type` values.
pub mod message_type {
    /// Client heartbeat.
    pub const PING: &str = "PING";
    /// Heartbeat acknowledgment.
    pub const PONG: &str = "PONG";
    /// Join a room.
    pub const JOIN: &str = "JOIN";
    /// Leave a room.
    pub const LEAVE: &str = "LEAVE";
    /// Delivered batch.
    pub const PUSH: &str = "PUSH";
}

const PONG_FRAME: &str = r#"{"type":"PONG","data":{}}"#;

/// The `{type, data}` envelope as read off the wire.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific payload, left undecoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

impl Envelope {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Deserialize)]
struct RoomData {
    #[serde(default)]
    room: String,
}

/// A decoded client request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientRequest {
    /// Refresh the heartbeat and reply `PONG`.
    Ping,
    /// Join a room.
    Join {
        /// Room name.
        room: String,
    },
    /// Leave a room.
    Leave {
        /// Room name.
        room: String,
    },
}

impl ClientRequest {
    /// Interpret an envelope.
    ///
    /// Returns `Ok(None)` for unknown types, which are ignored.
    pub fn from_envelope(envelope: &Envelope) -> Result<Option<Self>, ProtocolError> {
        match envelope.kind.as_str() {
            message_type::PING => Ok(Some(Self::Ping)),
            message_type::JOIN => {
                let room = room_of(message_type::JOIN, envelope.data.as_deref())?;
                Ok(Some(Self::Join { room }))
            }
            message_type::LEAVE => {
                let room = room_of(message_type::LEAVE, envelope.data.as_deref())?;
                Ok(Some(Self::Leave { room }))
            }
            _ => Ok(None),
        }
    }
}

fn room_of(kind: &'static str, data: Option<&RawValue>) -> Result<String, ProtocolError> {
    let data = data.ok_or(ProtocolError::MissingRoom { kind })?;
    let parsed: RoomData = serde_json::from_str(data.get())
        .map_err(|source| ProtocolError::MalformedData { kind, source })?;
    if parsed.room.is_empty() {
        return Err(ProtocolError::MissingRoom { kind });
    }
    Ok(parsed.room)
}

/// The `data` of a `PUSH` frame: an ordered batch of opaque fragments.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PushPayload {
    /// Fragments in arrival order.
    pub items: Vec<Box<RawValue>>,
}

impl PushPayload {
    /// Payload over the given fragments.
    pub fn new(items: Vec<Box<RawValue>>) -> Self {
        Self { items }
    }
}

#[derive(Serialize)]
struct Outbound<'a, T> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a T,
}

/// Encode a `PUSH` frame.
pub fn encode_push(payload: &PushPayload) -> Result<Frame, serde_json::Error> {
    let text = serde_json::to_string(&Outbound {
        kind: message_type::PUSH,
        data: payload,
    })?;
    Ok(Arc::new(text))
}

/// Encode a `PONG` frame.
pub fn encode_pong() -> Frame {
    Arc::new(PONG_FRAME.to_owned())
}
