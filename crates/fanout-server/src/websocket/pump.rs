//! Read and write pumps: the only code touching the socket.
//!
//! Both pumps run as independent tasks and close the connection when they
//! stop, for whatever reason. Each stops as soon as the connection closes.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use fanout_core::protocol::{Envelope, Frame};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use super::connection::Connection;

/// Decode text frames onto the inbound queue.
///
/// An undecodable frame, a close frame, a transport error or end of stream
/// closes the connection. Binary, ping and pong frames are ignored.
pub async fn read_pump<S, E>(mut stream: S, conn: Arc<Connection>, inbound: mpsc::Sender<Envelope>)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            biased;
            () = conn.closed() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => match Envelope::decode(text.as_str()) {
                Ok(envelope) => {
                    if inbound.send(envelope).await.is_err() {
                        break;
                    }
                }
                Err(e) if e.is_fatal() => {
                    debug!(conn_id = %conn.id(), error = %e, "undecodable frame, closing");
                    break;
                }
                Err(e) => debug!(conn_id = %conn.id(), error = %e, "ignoring frame"),
            },
            Some(Ok(Message::Close(_))) | None => {
                debug!(conn_id = %conn.id(), "peer closed");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(conn_id = %conn.id(), error = %e, "read failed");
                break;
            }
        }
    }
    let _ = conn.close();
}

/// Drain the outbound queue onto the socket.
///
/// Each write must finish within `write_timeout`. A failed or timed-out
/// write closes the connection.
pub async fn write_pump<K>(
    mut sink: K,
    conn: Arc<Connection>,
    mut outbound: mpsc::Receiver<Frame>,
    write_timeout: Duration,
) where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    loop {
        let frame = tokio::select! {
            biased;
            () = conn.closed() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let message = Message::Text(frame.as_str().into());
        match tokio::time::timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(conn_id = %conn.id(), error = %e, "write failed");
                break;
            }
            Err(_) => {
                debug!(conn_id = %conn.id(), timeout = ?write_timeout, "write timed out");
                break;
            }
        }
    }
    let _ = conn.close();
    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
}
