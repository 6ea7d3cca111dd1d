//! # fanout-core
//!
//! Shared vocabulary for the real-time fan-out tier.
//!
//! - **Protocol**: the `{type, data}` client envelope, decoded client
//!   requests (`PING`/`JOIN`/`LEAVE`) and the server frames (`PONG`/`PUSH`)
//! - **Identities**: [`ConnectionId`] and its process-wide generator
//! - **Errors**: saturation, membership and protocol failures as typed enums
//! - **Logging**: [`logging::init_subscriber`] for the `tracing` subscriber

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod protocol;

pub use errors::{MergeError, ProtocolError, RegistryError, SendError};
pub use ids::{ConnectionId, ConnectionIdGenerator};
pub use protocol::{ClientRequest, Envelope, Frame, PushPayload};
