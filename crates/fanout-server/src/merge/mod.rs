//! Merge layer: batches many small publishes into fewer, larger pushes.
//!
//! One worker serves broadcasts; `worker_count` workers serve rooms, each
//! room pinned to one worker by [`room_worker_index`] so its items are
//! batched in arrival order. A batch is committed to the registry when it
//! reaches `max_batch_size` or when its `max_delay` timer fires, whichever
//! comes first. A timer that fires for a batch already committed by size is
//! recognized by batch identity and ignored.

pub mod worker;

use std::sync::Arc;

use fanout_core::errors::MergeError;
use fanout_settings::MergeSettings;
use metrics::counter;
use parking_lot::Mutex;
use serde_json::value::RawValue;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use self::worker::{BatchKey, MergeItem, MergeWorker};
use crate::metrics::MERGE_DROPS_TOTAL;
use crate::registry::PushSink;

/// Merge worker serving `room`: polynomial hash, base 33, modulo `worker_count`.
pub fn room_worker_index(room: &str, worker_count: usize) -> usize {
    let n = worker_count.max(1);
    room.bytes()
        .fold(0usize, |h, b| (h * 33 + usize::from(b)) % n)
}

/// Front door for publishes.
pub struct MergeLayer {
    broadcast: mpsc::Sender<MergeItem>,
    rooms: Vec<mpsc::Sender<MergeItem>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MergeLayer {
    /// Spawn the broadcast worker and the room workers.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(settings: &MergeSettings, sink: Arc<dyn PushSink>, cancel: CancellationToken) -> Self {
        let worker_count = settings.worker_count.max(1);
        let mut tasks = Vec::with_capacity(worker_count + 1);

        let mut spawn = |name: String| {
            let (tx, rx) = mpsc::channel(settings.channel_size);
            let worker = MergeWorker::new(
                name,
                rx,
                settings.max_delay(),
                settings.max_batch_size,
                Arc::clone(&sink),
            );
            tasks.push(tokio::spawn(worker.run(cancel.clone())));
            tx
        };

        let broadcast = spawn("broadcast".to_string());
        let rooms = (0..worker_count).map(|i| spawn(format!("room-{i}"))).collect();

        debug!(
            room_workers = worker_count,
            max_delay_ms = settings.max_delay_ms,
            max_batch_size = settings.max_batch_size,
            "merge layer started"
        );

        Self {
            broadcast,
            rooms,
            cancel,
            tasks: Mutex::new(tasks),
        }
    }

    /// Queue `item` for the next broadcast batch.
    pub fn push_all(&self, item: Box<RawValue>) -> Result<(), MergeError> {
        let item = MergeItem {
            key: BatchKey::Broadcast,
            item,
        };
        self.admit(&self.broadcast, item)
    }

    /// Queue `item` for the next batch to `room`.
    pub fn push_room(&self, room: &str, item: Box<RawValue>) -> Result<(), MergeError> {
        let tx = &self.rooms[room_worker_index(room, self.rooms.len())];
        let item = MergeItem {
            key: BatchKey::Room(room.to_owned()),
            item,
        };
        self.admit(tx, item)
    }

    fn admit(&self, tx: &mpsc::Sender<MergeItem>, item: MergeItem) -> Result<(), MergeError> {
        if self.cancel.is_cancelled() {
            return Err(MergeError::ShutDown);
        }
        match tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                counter!(MERGE_DROPS_TOTAL).increment(1);
                Err(MergeError::MergeQueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(MergeError::ShutDown),
        }
    }

    #[cfg(test)]
    fn room_worker_count(&self) -> usize {
        self.rooms.len()
    }

    /// Stop all workers. Open batches are discarded.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Worker handles, for awaiting them during shutdown.
    pub fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks.lock())
    }
}
