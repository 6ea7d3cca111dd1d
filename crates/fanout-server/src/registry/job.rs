//! Units of fan-out work.

use std::sync::Arc;

use fanout_core::protocol::{Frame, PushPayload};
use tokio::sync::OwnedSemaphorePermit;

/// Who a push is for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PushTarget {
    /// Every connection.
    All,
    /// Members of the named room, across all shards.
    Room(Arc<str>),
}

/// A push submitted to the registry, consumed once by a dispatch task.
#[derive(Debug)]
pub struct PushJob {
    /// Destination.
    pub target: PushTarget,
    /// Ordered fragments to deliver.
    pub payload: PushPayload,
}

/// One shard's share of a push job.
///
/// Holds the shard's admission permit until the shard worker drops it.
#[derive(Debug)]
pub(crate) struct ShardJob {
    pub(crate) target: PushTarget,
    pub(crate) frame: Frame,
    pub(crate) _permit: OwnedSemaphorePermit,
}
