//! Listener settings: the WebSocket endpoint and the publish service.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// WebSocket endpoint and per-connection settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SocketSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Upgrade handshake timeout in milliseconds.
    pub read_timeout_ms: u64,
    /// Per-frame write timeout in milliseconds.
    pub write_timeout_ms: u64,
    /// Per-connection inbound queue capacity.
    pub in_channel_size: usize,
    /// Per-connection outbound queue capacity.
    pub out_channel_size: usize,
    /// Liveness check period, and the maximum age of the last heartbeat.
    pub heartbeat_interval_secs: u64,
    /// Maximum number of rooms one connection may join.
    pub max_join_room: usize,
}

impl SocketSettings {
    /// Upgrade handshake timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Per-frame write timeout.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7777,
            read_timeout_ms: 2000,
            write_timeout_ms: 2000,
            in_channel_size: 1000,
            out_channel_size: 1000,
            heartbeat_interval_secs: 60,
            max_join_room: 5,
        }
    }
}

/// Publish service (push boundary, health, metrics) settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Request read budget in milliseconds.
    pub read_timeout_ms: u64,
    /// Response write budget in milliseconds.
    pub write_timeout_ms: u64,
    /// PEM certificate chain. TLS is enabled when this and the key are set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cert_path: Option<PathBuf>,
    /// PEM private key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_key_path: Option<PathBuf>,
}

impl ServiceSettings {
    /// Whole-request timeout: the read and write budgets combined.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.saturating_add(self.write_timeout_ms))
    }

    /// Certificate and key paths, if both are configured.
    pub fn tls_pair(&self) -> Option<(&PathBuf, &PathBuf)> {
        self.tls_cert_path.as_ref().zip(self.tls_key_path.as_ref())
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7788,
            read_timeout_ms: 2000,
            write_timeout_ms: 2000,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_defaults() {
        let s = SocketSettings::default();
        assert_eq!(s.port, 7777);
        assert_eq!(s.max_join_room, 5);
        assert_eq!(s.heartbeat_interval(), Duration::from_secs(60));
        assert_eq!(s.write_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn socket_camel_case_partial() {
        let s: SocketSettings =
            serde_json::from_str(r#"{"outChannelSize": 8, "maxJoinRoom": 2}"#).unwrap();
        assert_eq!(s.out_channel_size, 8);
        assert_eq!(s.max_join_room, 2);
        assert_eq!(s.in_channel_size, 1000);
    }

    #[test]
    fn service_tls_pair_requires_both() {
        let mut s = ServiceSettings::default();
        assert!(s.tls_pair().is_none());
        s.tls_cert_path = Some("cert.pem".into());
        assert!(s.tls_pair().is_none());
        s.tls_key_path = Some("key.pem".into());
        assert!(s.tls_pair().is_some());
    }

    #[test]
    fn service_omits_unset_tls_paths() {
        let json = serde_json::to_value(ServiceSettings::default()).unwrap();
        assert!(json.get("tlsCertPath").is_none());
        assert_eq!(json["readTimeoutMs"], 2000);
        assert_eq!(
            ServiceSettings::default().request_timeout(),
            Duration::from_secs(4)
        );
    }
}
