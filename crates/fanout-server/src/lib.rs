//! # fanout-server
//!
//! Real-time fan-out tier: WebSocket clients join rooms, backend services
//! publish over HTTP, and messages are batched then delivered.
//!
//! - Sharded connection registry with a bounded dispatch pool
//! - Merge layer batching fragments per room (size or delay trigger)
//! - `WebSocket` endpoint: read/write pumps, heartbeat, PING/JOIN/LEAVE
//! - Publish boundary: `POST /push/all`, `POST /push/room`
//! - Health, Prometheus metrics, ordered graceful shutdown

#![deny(unsafe_code)]
pub mod errors;
pub mod health;
pub mod merge;
pub mod metrics;
pub mod push;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use errors::ServerError;
pub use merge::MergeLayer;
pub use registry::{ConnectionRegistry, PushSink};
pub use server::{FanoutServer, ServerHandle, ServiceState};
pub use shutdown::{DEFAULT_SHUTDOWN_TIMEOUT, ShutdownCoordinator};
