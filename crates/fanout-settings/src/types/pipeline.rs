//! Registry and merge-layer sizing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection registry sizing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistrySettings {
    /// Number of shards.
    pub shard_count: usize,
    /// Dispatch queue capacity.
    pub dispatch_channel_size: usize,
    /// Dispatch task pool size.
    pub dispatch_worker_count: usize,
    /// Per-shard job queue capacity. Also the shard's admission permit count.
    pub shard_job_channel_size: usize,
    /// Per-shard worker pool size.
    pub shard_job_worker_count: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            shard_count: 16,
            dispatch_channel_size: 1000,
            dispatch_worker_count: 16,
            shard_job_channel_size: 1000,
            shard_job_worker_count: 2,
        }
    }
}

/// Merge layer sizing and batch bounds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MergeSettings {
    /// Number of room merge workers. One broadcast worker always exists on top.
    pub worker_count: usize,
    /// Input queue capacity per worker.
    pub channel_size: usize,
    /// Batch expiry delay in milliseconds.
    pub max_delay_ms: u64,
    /// Batch size that triggers an immediate commit.
    pub max_batch_size: usize,
}

impl MergeSettings {
    /// Batch expiry delay.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            worker_count: 8,
            channel_size: 1000,
            max_delay_ms: 300,
            max_batch_size: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_defaults() {
        let r = RegistrySettings::default();
        assert_eq!(r.shard_count, 16);
        assert_eq!(r.shard_job_worker_count, 2);
    }

    #[test]
    fn merge_defaults() {
        let m = MergeSettings::default();
        assert_eq!(m.max_delay(), Duration::from_millis(300));
        assert_eq!(m.max_batch_size, 100);
    }

    #[test]
    fn merge_roundtrip_camel_case() {
        let json = serde_json::to_value(MergeSettings::default()).unwrap();
        assert_eq!(json["maxDelayMs"], 300);
        assert_eq!(json["maxBatchSize"], 100);
        assert_eq!(json["channelSize"], 1000);
    }
}
