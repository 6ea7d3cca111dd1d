//! Sharded connection/room registry and its dispatch pipeline.
//!
//! ```text
//! push_all / push_room ──try_send──▶ dispatch queue
//!                                        │ (dispatch workers)
//!                      ┌─────────────────┼─────────────────┐
//!                try_admit          try_admit          try_admit      (permit + try_send)
//!                      ▼                 ▼                 ▼
//!                shard 0 queue     shard 1 queue  ...  shard N queue
//!                      │ (shard workers)
//!                      ▼
//!              Shard::broadcast_* ──try_send──▶ connection outbound queues
//! ```
//!
//! Every admission is non-blocking. A saturated shard is skipped for that
//! one push while the other shards still receive it.

pub mod job;
pub mod room;
pub mod shard;

use std::sync::Arc;

use fanout_core::errors::RegistryError;
use fanout_core::ids::ConnectionId;
use fanout_core::protocol::{self, PushPayload};
use fanout_settings::RegistrySettings;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as AsyncMutex, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use self::job::{PushJob, PushTarget, ShardJob};
use self::shard::Shard;
use crate::metrics::{REGISTRY_DISPATCH_DROPS_TOTAL, REGISTRY_SHARD_SKIPS_TOTAL};
use crate::websocket::connection::Connection;

/// Shard index for a connection identity.
///
/// A `shard_count` of zero is treated as one.
// The remainder is below shard_count, so it always fits back into usize.
#[allow(clippy::cast_possible_truncation)]
pub fn route(id: ConnectionId, shard_count: usize) -> usize {
    (id.get() % shard_count.max(1) as u64) as usize
}

/// Destination for committed batches.
///
/// Implemented by [`ConnectionRegistry`]; the merge layer only needs this.
pub trait PushSink: Send + Sync + 'static {
    /// Deliver `payload` to every connection.
    fn push_all(&self, payload: PushPayload) -> Result<(), RegistryError>;
    /// Deliver `payload` to the members of `room`.
    fn push_room(&self, room: &str, payload: PushPayload) -> Result<(), RegistryError>;
}

/// A shard's job queue and admission permits, as seen by dispatch workers.
struct ShardQueue {
    shard: Arc<Shard>,
    tx: mpsc::Sender<ShardJob>,
    permits: Arc<Semaphore>,
}

impl ShardQueue {
    /// Hand the shard its share of a push without waiting.
    fn try_admit(&self, target: &PushTarget, frame: &protocol::Frame) -> bool {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            return false;
        };
        let job = ShardJob {
            target: target.clone(),
            frame: Arc::clone(frame),
            _permit: permit,
        };
        self.tx.try_send(job).is_ok()
    }
}

/// Routes connections to shards and fans pushes out to every shard.
pub struct ConnectionRegistry {
    shards: Vec<Arc<Shard>>,
    dispatch_tx: mpsc::Sender<PushJob>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionRegistry {
    /// Build the shards and spawn the dispatch and shard worker pools.
    ///
    /// Must be called inside a Tokio runtime. Workers stop when `cancel`
    /// fires or [`shutdown`](Self::shutdown) is called.
    pub fn new(settings: &RegistrySettings, cancel: CancellationToken) -> Self {
        let shard_count = settings.shard_count.max(1);
        let mut tasks = Vec::new();
        let mut shards = Vec::with_capacity(shard_count);
        let mut queues = Vec::with_capacity(shard_count);

        for index in 0..shard_count {
            let shard = Arc::new(Shard::new(index));
            let (tx, rx) = mpsc::channel(settings.shard_job_channel_size);
            let rx = Arc::new(AsyncMutex::new(rx));
            for _ in 0..settings.shard_job_worker_count {
                tasks.push(tokio::spawn(run_shard_worker(
                    Arc::clone(&shard),
                    Arc::clone(&rx),
                    cancel.clone(),
                )));
            }
            queues.push(ShardQueue {
                shard: Arc::clone(&shard),
                tx,
                permits: Arc::new(Semaphore::new(settings.shard_job_channel_size)),
            });
            shards.push(shard);
        }

        let (dispatch_tx, dispatch_rx) = mpsc::channel(settings.dispatch_channel_size);
        let dispatch_rx = Arc::new(AsyncMutex::new(dispatch_rx));
        let queues: Arc<[ShardQueue]> = queues.into();
        for worker in 0..settings.dispatch_worker_count {
            tasks.push(tokio::spawn(run_dispatcher(
                worker,
                Arc::clone(&dispatch_rx),
                Arc::clone(&queues),
                cancel.clone(),
            )));
        }

        debug!(
            shards = shard_count,
            dispatch_workers = settings.dispatch_worker_count,
            shard_workers = settings.shard_job_worker_count,
            "connection registry started"
        );

        Self {
            shards,
            dispatch_tx,
            cancel,
            tasks: Mutex::new(tasks),
        }
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard index for `id`.
    pub fn route(&self, id: ConnectionId) -> usize {
        route(id, self.shards.len())
    }

    /// The shard owning `id`.
    pub fn shard_for(&self, id: ConnectionId) -> &Arc<Shard> {
        &self.shards[self.route(id)]
    }

    /// Register a connection with its shard.
    pub fn add_connection(&self, conn: Arc<Connection>) {
        self.shard_for(conn.id()).add_connection(conn);
    }

    /// Deregister a connection. Idempotent.
    pub fn remove_connection(&self, id: ConnectionId) {
        let _ = self.shard_for(id).remove_connection(id);
    }

    /// Join `room` on the connection's shard.
    pub fn join_room(&self, room: &str, id: ConnectionId) -> Result<(), RegistryError> {
        self.shard_for(id).join_room(room, id)
    }

    /// Leave `room` on the connection's shard.
    pub fn leave_room(&self, room: &str, id: ConnectionId) -> Result<(), RegistryError> {
        self.shard_for(id).leave_room(room, id)
    }

    /// Queue a push to every connection.
    pub fn push_all(&self, payload: PushPayload) -> Result<(), RegistryError> {
        self.enqueue(PushJob {
            target: PushTarget::All,
            payload,
        })
    }

    /// Queue a push to the members of `room` on every shard.
    pub fn push_room(&self, room: &str, payload: PushPayload) -> Result<(), RegistryError> {
        self.enqueue(PushJob {
            target: PushTarget::Room(Arc::from(room)),
            payload,
        })
    }

    fn enqueue(&self, job: PushJob) -> Result<(), RegistryError> {
        if self.cancel.is_cancelled() {
            return Err(RegistryError::ShutDown);
        }
        match self.dispatch_tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                counter!(REGISTRY_DISPATCH_DROPS_TOTAL).increment(1);
                Err(RegistryError::DispatchQueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(RegistryError::ShutDown),
        }
    }

    /// Stop the dispatch and shard workers. Queued jobs are discarded.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Worker handles, for awaiting them during shutdown.
    pub fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks.lock())
    }

    /// Connections across all shards.
    pub fn connection_count(&self) -> usize {
        self.shards.iter().map(|s| s.connection_count()).sum()
    }

    /// Shard-local room instances across all shards.
    pub fn room_count(&self) -> usize {
        self.shards.iter().map(|s| s.room_count()).sum()
    }

    /// Members of the logical room `name` (the union over shards).
    pub fn room_member_count(&self, name: &str) -> usize {
        self.shards.iter().map(|s| s.room_member_count(name)).sum()
    }
}

impl PushSink for ConnectionRegistry {
    fn push_all(&self, payload: PushPayload) -> Result<(), RegistryError> {
        ConnectionRegistry::push_all(self, payload)
    }

    fn push_room(&self, room: &str, payload: PushPayload) -> Result<(), RegistryError> {
        ConnectionRegistry::push_room(self, room, payload)
    }
}

async fn recv_shared<T>(rx: &AsyncMutex<mpsc::Receiver<T>>) -> Option<T> {
    rx.lock().await.recv().await
}

async fn run_dispatcher(
    worker: usize,
    rx: Arc<AsyncMutex<mpsc::Receiver<PushJob>>>,
    queues: Arc<[ShardQueue]>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            job = recv_shared(&rx) => match job {
                Some(job) => job,
                None => break,
            },
        };

        let frame = match protocol::encode_push(&job.payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(worker, error = %e, "failed to encode push, dropping");
                continue;
            }
        };

        for queue in queues.iter() {
            if !queue.try_admit(&job.target, &frame) {
                counter!(REGISTRY_SHARD_SKIPS_TOTAL).increment(1);
                warn!(worker, shard = queue.shard.index(), "shard saturated, skipping push");
            }
        }
    }
    debug!(worker, "dispatch worker stopped");
}

async fn run_shard_worker(
    shard: Arc<Shard>,
    rx: Arc<AsyncMutex<mpsc::Receiver<ShardJob>>>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            job = recv_shared(&rx) => match job {
                Some(job) => job,
                None => break,
            },
        };

        let _ = match &job.target {
            PushTarget::All => shard.broadcast_all(&job.frame),
            PushTarget::Room(room) => shard.broadcast_room(room, &job.frame),
        };
        // Dropping the job releases the admission permit.
        drop(job);
    }
    debug!(shard = shard.index(), "shard worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::{ConnectionLimits, ConnectionQueues};
    use proptest::prelude::*;
    use serde_json::value::RawValue;
    use std::time::Duration;

    fn settings(shards: usize) -> RegistrySettings {
        RegistrySettings {
            shard_count: shards,
            dispatch_channel_size: 16,
            dispatch_worker_count: 2,
            shard_job_channel_size: 16,
            shard_job_worker_count: 1,
        }
    }

    fn make_connection(id: u64) -> (Arc<Connection>, ConnectionQueues) {
        let (conn, queues) = Connection::new(ConnectionId::new(id), &ConnectionLimits::default());
        (Arc::new(conn), queues)
    }

    fn payload(items: &[&str]) -> PushPayload {
        PushPayload::new(
            items
                .iter()
                .map(|s| RawValue::from_string((*s).to_owned()).unwrap())
                .collect(),
        )
    }

    async fn recv(queues: &mut ConnectionQueues) -> String {
        let frame = tokio::time::timeout(Duration::from_secs(2), queues.outbound_rx.recv())
            .await
            .expect("frame within timeout")
            .expect("queue open");
        frame.as_str().to_owned()
    }

    proptest! {
        #[test]
        fn route_is_identity_mod_shard_count(id in any::<u64>(), shards in 1usize..512) {
            let index = route(ConnectionId::new(id), shards);
            prop_assert!(index < shards);
            prop_assert_eq!(index as u64, id % shards as u64);
            prop_assert_eq!(index, route(ConnectionId::new(id), shards));
        }
    }

    #[test]
    fn zero_shard_count_routes_to_first_shard() {
        assert_eq!(route(ConnectionId::new(12_345), 0), 0);
        assert_eq!(route(ConnectionId::new(0), 0), 0);
    }

    #[tokio::test]
    async fn dispatcher_skips_saturated_shard_and_delivers_to_the_rest() {
        // Shard 0 has no admission permits left; shard 1 is healthy.
        let shards = [Arc::new(Shard::new(0)), Arc::new(Shard::new(1))];
        let (tx0, _rx0) = mpsc::channel(1);
        let (tx1, rx1) = mpsc::channel(4);
        let queues: Arc<[ShardQueue]> = vec![
            ShardQueue {
                shard: Arc::clone(&shards[0]),
                tx: tx0,
                permits: Arc::new(Semaphore::new(0)),
            },
            ShardQueue {
                shard: Arc::clone(&shards[1]),
                tx: tx1,
                permits: Arc::new(Semaphore::new(4)),
            },
        ]
        .into();

        let (blocked, mut blocked_q) = make_connection(0);
        let (open, mut open_q) = make_connection(1);
        shards[0].add_connection(blocked);
        shards[1].add_connection(open);

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_shard_worker(
            Arc::clone(&shards[1]),
            Arc::new(AsyncMutex::new(rx1)),
            cancel.clone(),
        ));
        let (dispatch_tx, dispatch_rx) = mpsc::channel(4);
        let dispatcher = tokio::spawn(run_dispatcher(
            0,
            Arc::new(AsyncMutex::new(dispatch_rx)),
            Arc::clone(&queues),
            cancel.clone(),
        ));

        dispatch_tx
            .send(PushJob {
                target: PushTarget::All,
                payload: payload(&["1"]),
            })
            .await
            .unwrap();

        assert_eq!(recv(&mut open_q).await, r#"{"type":"PUSH","data":{"items":[1]}}"#);
        assert!(blocked_q.outbound_rx.try_recv().is_err());
        assert_eq!(queues[0].permits.available_permits(), 0);

        cancel.cancel();
        dispatcher.await.unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn connections_land_on_routed_shard() {
        let registry = ConnectionRegistry::new(&settings(4), CancellationToken::new());
        let (conn, _q) = make_connection(10);
        registry.add_connection(conn);
        assert_eq!(registry.route(ConnectionId::new(10)), 2);
        assert_eq!(registry.shards[2].connection_count(), 1);
        assert_eq!(registry.connection_count(), 1);

        registry.remove_connection(ConnectionId::new(10));
        registry.remove_connection(ConnectionId::new(10));
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn logical_room_is_union_of_shards() {
        let registry = ConnectionRegistry::new(&settings(4), CancellationToken::new());
        for id in [0, 1, 5] {
            registry.join_room("lobby", ConnectionId::new(id)).unwrap();
        }
        // ids 1 and 5 share shard 1, id 0 is on shard 0
        assert_eq!(registry.room_count(), 2);
        assert_eq!(registry.room_member_count("lobby"), 3);

        for id in [0, 1, 5] {
            registry.leave_room("lobby", ConnectionId::new(id)).unwrap();
        }
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn push_room_reaches_members_on_every_shard() {
        let registry = ConnectionRegistry::new(&settings(4), CancellationToken::new());
        let (a, mut qa) = make_connection(1);
        let (b, mut qb) = make_connection(2);
        let (c, mut qc) = make_connection(3);
        for conn in [&a, &b, &c] {
            registry.add_connection(Arc::clone(conn));
        }
        registry.join_room("lobby", a.id()).unwrap();
        registry.join_room("lobby", b.id()).unwrap();

        registry.push_room("lobby", payload(&["1", "2"])).unwrap();
        let expected = r#"{"type":"PUSH","data":{"items":[1,2]}}"#;
        assert_eq!(recv(&mut qa).await, expected);
        assert_eq!(recv(&mut qb).await, expected);

        registry.push_all(payload(&[r#""all""#])).unwrap();
        let expected = r#"{"type":"PUSH","data":{"items":["all"]}}"#;
        assert_eq!(recv(&mut qa).await, expected);
        assert_eq!(recv(&mut qb).await, expected);
        // c never joined the room, so the broadcast is the first thing it sees
        assert_eq!(recv(&mut qc).await, expected);
    }

    #[tokio::test]
    async fn full_dispatch_queue_rejects_push() {
        let mut s = settings(2);
        s.dispatch_channel_size = 1;
        let registry = ConnectionRegistry::new(&s, CancellationToken::new());

        // Workers have not been polled yet on the current-thread runtime.
        registry.push_all(payload(&["1"])).unwrap();
        assert_eq!(
            registry.push_all(payload(&["2"])),
            Err(RegistryError::DispatchQueueFull)
        );
    }

    #[tokio::test]
    async fn saturated_shard_is_skipped() {
        let shard = Arc::new(Shard::new(0));
        let (tx, _rx) = mpsc::channel(1);
        let queue = ShardQueue {
            shard,
            tx,
            permits: Arc::new(Semaphore::new(1)),
        };
        let frame: protocol::Frame = Arc::new("f".to_owned());

        assert!(queue.try_admit(&PushTarget::All, &frame));
        assert!(!queue.try_admit(&PushTarget::All, &frame));
        assert_eq!(queue.permits.available_permits(), 0);
    }

    #[tokio::test]
    async fn permit_released_when_shard_queue_rejects() {
        let shard = Arc::new(Shard::new(0));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let queue = ShardQueue {
            shard,
            tx,
            permits: Arc::new(Semaphore::new(1)),
        };
        let frame: protocol::Frame = Arc::new("f".to_owned());

        assert!(!queue.try_admit(&PushTarget::All, &frame));
        assert_eq!(queue.permits.available_permits(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_workers_and_rejects_pushes() {
        let registry = ConnectionRegistry::new(&settings(2), CancellationToken::new());
        registry.shutdown();
        assert_eq!(
            registry.push_all(payload(&["1"])),
            Err(RegistryError::ShutDown)
        );

        let tasks = registry.take_tasks();
        assert_eq!(tasks.len(), 2 + 2);
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .unwrap()
                .unwrap();
        }
        assert!(registry.take_tasks().is_empty());
    }
}
