//! A single merge worker: owns the open batches for its destinations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fanout_core::protocol::PushPayload;
use metrics::counter;
use serde_json::value::RawValue;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::{MERGE_BATCHES_TOTAL, MERGE_STALE_TIMERS_TOTAL};
use crate::registry::PushSink;

/// Destination a batch accumulates for.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BatchKey {
    /// Every connection.
    Broadcast,
    /// One logical room.
    Room(String),
}

/// One fragment on its way into a batch.
#[derive(Debug)]
pub struct MergeItem {
    /// Destination.
    pub key: BatchKey,
    /// Opaque fragment.
    pub item: Box<RawValue>,
}

/// Batch identity, unique per worker. Used to spot stale timer fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BatchId(u64);

#[derive(Debug)]
pub(crate) struct Expiry {
    key: BatchKey,
    batch: BatchId,
}

struct Batch {
    id: BatchId,
    items: Vec<Box<RawValue>>,
    timer: Option<AbortHandle>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Trigger {
    Size,
    Timer,
}

impl Trigger {
    fn label(self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Timer => "timer",
        }
    }
}

pub(crate) struct MergeWorker {
    name: String,
    input: mpsc::Receiver<MergeItem>,
    expiry_tx: mpsc::Sender<Expiry>,
    expiry_rx: mpsc::Receiver<Expiry>,
    batches: HashMap<BatchKey, Batch>,
    next_batch: u64,
    max_delay: Duration,
    max_batch_size: usize,
    sink: Arc<dyn PushSink>,
}

impl MergeWorker {
    pub(crate) fn new(
        name: String,
        input: mpsc::Receiver<MergeItem>,
        max_delay: Duration,
        max_batch_size: usize,
        sink: Arc<dyn PushSink>,
    ) -> Self {
        let (expiry_tx, expiry_rx) = mpsc::channel(64);
        Self {
            name,
            input,
            expiry_tx,
            expiry_rx,
            batches: HashMap::new(),
            next_batch: 0,
            max_delay,
            max_batch_size: max_batch_size.max(1),
            sink,
        }
    }

    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(expiry) = self.expiry_rx.recv() => self.on_expiry(&expiry),
                item = self.input.recv() => match item {
                    Some(item) => self.on_item(item),
                    None => break,
                },
            }
        }

        // Open batches are discarded, not flushed.
        for batch in self.batches.values() {
            if let Some(timer) = &batch.timer {
                timer.abort();
            }
        }
        debug!(worker = %self.name, discarded = self.batches.len(), "merge worker stopped");
    }

    pub(crate) fn on_item(&mut self, item: MergeItem) {
        let MergeItem { key, item } = item;
        let next_id = &mut self.next_batch;
        let batch = self.batches.entry(key.clone()).or_insert_with(|| {
            *next_id += 1;
            Batch {
                id: BatchId(*next_id),
                items: Vec::new(),
                timer: None,
            }
        });
        batch.items.push(item);

        if batch.items.len() >= self.max_batch_size {
            self.commit(&key, Trigger::Size);
        } else if batch.timer.is_none() {
            batch.timer = Some(spawn_timer(
                self.expiry_tx.clone(),
                key,
                batch.id,
                self.max_delay,
            ));
        }
    }

    pub(crate) fn on_expiry(&mut self, expiry: &Expiry) {
        let current = self
            .batches
            .get(&expiry.key)
            .is_some_and(|batch| batch.id == expiry.batch);
        if current {
            self.commit(&expiry.key, Trigger::Timer);
        } else {
            counter!(MERGE_STALE_TIMERS_TOTAL).increment(1);
            debug!(worker = %self.name, key = ?expiry.key, "ignoring stale batch timer");
        }
    }

    fn commit(&mut self, key: &BatchKey, trigger: Trigger) {
        let Some(batch) = self.batches.remove(key) else {
            return;
        };
        if let Some(timer) = batch.timer {
            timer.abort();
        }

        let size = batch.items.len();
        let payload = PushPayload::new(batch.items);
        counter!(MERGE_BATCHES_TOTAL, "trigger" => trigger.label()).increment(1);

        let result = match key {
            BatchKey::Broadcast => self.sink.push_all(payload),
            BatchKey::Room(room) => self.sink.push_room(room, payload),
        };
        match result {
            Ok(()) => debug!(worker = %self.name, ?key, size, trigger = trigger.label(), "batch committed"),
            Err(e) => warn!(worker = %self.name, ?key, size, error = %e, "batch dropped by registry"),
        }
    }

    #[cfg(test)]
    fn open_batch(&self, key: &BatchKey) -> Option<BatchId> {
        self.batches.get(key).map(|b| b.id)
    }
}

fn spawn_timer(
    tx: mpsc::Sender<Expiry>,
    key: BatchKey,
    batch: BatchId,
    delay: Duration,
) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        // The worker may be gone during shutdown.
        let _ = tx.send(Expiry { key, batch }).await;
    })
    .abort_handle()
}
