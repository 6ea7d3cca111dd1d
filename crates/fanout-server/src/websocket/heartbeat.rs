//! Heartbeat liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::time;
use tracing::info;

use super::connection::Connection;
use crate::metrics::WS_HEARTBEAT_TIMEOUTS_TOTAL;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No heartbeat within the interval; the connection was closed.
    TimedOut,
    /// The connection closed for another reason.
    Closed,
}

/// Check liveness every `interval` until the connection closes.
///
/// A connection is alive while it is open and its last heartbeat is no older
/// than `interval`. The first failed check closes it.
pub async fn run_heartbeat(connection: Arc<Connection>, interval: Duration) -> HeartbeatResult {
    let mut check = time::interval_at(time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            biased;
            () = connection.closed() => return HeartbeatResult::Closed,
            _ = check.tick() => {
                if !connection.is_alive(interval) {
                    if connection.close() {
                        counter!(WS_HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
                        info!(conn_id = %connection.id(), "heartbeat timed out, closing connection");
                        return HeartbeatResult::TimedOut;
                    }
                    return HeartbeatResult::Closed;
                }
            }
        }
    }
}
