//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`,
//! so a config file only needs the fields it changes.

mod endpoint;
mod pipeline;

pub use endpoint::*;
pub use pipeline::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// # JSON Format
///
/// ```json
/// {
///   "socket": { "port": 7777, "maxJoinRoom": 5 },
///   "registry": { "shardCount": 32 },
///   "merge": { "maxDelayMs": 100 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FanoutSettings {
    /// WebSocket endpoint and per-connection limits.
    pub socket: SocketSettings,
    /// Publish service listener.
    pub service: ServiceSettings,
    /// Connection registry sizing.
    pub registry: RegistrySettings,
    /// Merge layer sizing.
    pub merge: MergeSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl FanoutSettings {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("socket.readTimeoutMs", self.socket.read_timeout_ms),
            ("socket.writeTimeoutMs", self.socket.write_timeout_ms),
            ("socket.heartbeatIntervalSecs", self.socket.heartbeat_interval_secs),
            ("service.readTimeoutMs", self.service.read_timeout_ms),
            ("service.writeTimeoutMs", self.service.write_timeout_ms),
            ("merge.maxDelayMs", self.merge.max_delay_ms),
        ];
        let positive_sizes = [
            ("socket.inChannelSize", self.socket.in_channel_size),
            ("socket.outChannelSize", self.socket.out_channel_size),
            ("socket.maxJoinRoom", self.socket.max_join_room),
            ("registry.shardCount", self.registry.shard_count),
            ("registry.dispatchChannelSize", self.registry.dispatch_channel_size),
            ("registry.dispatchWorkerCount", self.registry.dispatch_worker_count),
            ("registry.shardJobChannelSize", self.registry.shard_job_channel_size),
            ("registry.shardJobWorkerCount", self.registry.shard_job_worker_count),
            ("merge.workerCount", self.merge.worker_count),
            ("merge.channelSize", self.merge.channel_size),
            ("merge.maxBatchSize", self.merge.max_batch_size),
        ];

        if let Some((key, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(SettingsError::InvalidValue(format!("{key} must be > 0")));
        }
        if let Some((key, _)) = positive_sizes.iter().find(|(_, v)| *v == 0) {
            return Err(SettingsError::InvalidValue(format!("{key} must be > 0")));
        }
        if self.service.tls_cert_path.is_some() != self.service.tls_key_path.is_some() {
            return Err(SettingsError::InvalidValue(
                "service.tlsCertPath and service.tlsKeyPath must be set together".into(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`trace`, `debug`, `info`, `warn`, `error`) or an
    /// `EnvFilter` directive string.
    pub level: String,
    /// Emit JSON lines instead of the compact format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = FanoutSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.logging.level, "info");
        assert!(!settings.logging.json);
    }

    #[test]
    fn empty_json_is_default() {
        let settings: FanoutSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, FanoutSettings::default());
    }

    #[test]
    fn zero_shard_count_rejected() {
        let mut settings = FanoutSettings::default();
        settings.registry.shard_count = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("registry.shardCount"));
    }

    #[test]
    fn zero_delay_rejected() {
        let mut settings = FanoutSettings::default();
        settings.merge.max_delay_ms = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("merge.maxDelayMs"));
    }

    #[test]
    fn half_configured_tls_rejected() {
        let mut settings = FanoutSettings::default();
        settings.service.tls_key_path = Some("key.pem".into());
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidValue(_))
        ));
        settings.service.tls_cert_path = Some("cert.pem".into());
        settings.validate().unwrap();
    }
}
