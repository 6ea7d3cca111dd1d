//! WebSocket endpoint: connection state, pumps, heartbeat, protocol handler.

pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod pump;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use fanout_core::ids::ConnectionIdGenerator;
use futures::{Sink, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use self::connection::{Connection, ConnectionLimits};
use self::handler::ProtocolHandler;
use self::pump::{read_pump, write_pump};
use crate::registry::ConnectionRegistry;

/// Everything a new connection needs from the server.
#[derive(Clone)]
pub struct SocketContext {
    /// Shared registry.
    pub registry: Arc<ConnectionRegistry>,
    /// Identity source.
    pub ids: Arc<ConnectionIdGenerator>,
    /// Queue sizes and room cap.
    pub limits: ConnectionLimits,
    /// Liveness check period.
    pub heartbeat_interval: Duration,
    /// Per-frame write timeout.
    pub write_timeout: Duration,
    /// Process-wide stop signal.
    pub shutdown: CancellationToken,
}

/// Serve an upgraded socket until it closes.
pub async fn serve_socket(socket: WebSocket, ctx: SocketContext) {
    let (sink, stream) = socket.split();
    serve_connection(sink, stream, ctx).await;
}

/// Run one connection over any message sink/stream pair.
///
/// Spawns the read and write pumps, runs the protocol handler on the
/// current task, and returns once all three have finished.
pub async fn serve_connection<K, S, E>(sink: K, stream: S, ctx: SocketContext)
where
    K: Sink<Message> + Unpin + Send + 'static,
    K::Error: std::fmt::Display + Send,
    S: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (conn, queues) = Connection::new(ctx.ids.next_id(), &ctx.limits);
    let conn = Arc::new(conn);

    let writer = tokio::spawn(write_pump(
        sink,
        Arc::clone(&conn),
        queues.outbound_rx,
        ctx.write_timeout,
    ));
    let reader = tokio::spawn(read_pump(stream, Arc::clone(&conn), queues.inbound_tx));

    ProtocolHandler::new(conn, ctx.registry, ctx.heartbeat_interval)
        .run(queues.inbound_rx, ctx.shutdown)
        .await;

    let _ = tokio::join!(reader, writer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_settings::RegistrySettings;

    fn context(registry: &Arc<ConnectionRegistry>) -> SocketContext {
        SocketContext {
            registry: Arc::clone(registry),
            ids: Arc::new(ConnectionIdGenerator::starting_at(100)),
            limits: ConnectionLimits::default(),
            heartbeat_interval: Duration::from_secs(60),
            write_timeout: Duration::from_secs(1),
            shutdown: CancellationToken::new(),
        }
    }

    fn text(s: &str) -> Result<Message, std::io::Error> {
        Ok(Message::Text(s.into()))
    }

    #[tokio::test]
    async fn session_round_trip_over_channels() {
        let registry = Arc::new(ConnectionRegistry::new(
            &RegistrySettings::default(),
            CancellationToken::new(),
        ));
        let (client_tx, client_rx) = futures::channel::mpsc::unbounded();
        let (server_sink, mut server_out) = futures::channel::mpsc::unbounded::<Message>();

        let session = tokio::spawn(serve_connection(server_sink, client_rx, context(&registry)));

        client_tx
            .unbounded_send(text(r#"{"type":"JOIN","data":{"room":"lobby"}}"#))
            .unwrap();
        client_tx.unbounded_send(text(r#"{"type":"PING"}"#)).unwrap();

        let pong = server_out.next().await.unwrap();
        assert!(matches!(pong, Message::Text(ref t) if t.as_str().contains("PONG")));
        assert_eq!(registry.room_member_count("lobby"), 1);
        assert_eq!(registry.connection_count(), 1);

        drop(client_tx);
        session.await.unwrap();
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.room_count(), 0);
    }
}
