//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`FanoutSettings::default()`]
//! 2. If a config file exists, deep-merge its values over defaults
//! 3. Apply `FANOUT_*` environment variable overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::FanoutSettings;

/// Env var naming the config file (or a directory holding `config.json`).
pub const CONFIG_ENV: &str = "FANOUT_CONFIG";

/// File name looked up when the config path is a directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Resolve the config file path.
///
/// An explicit path wins over [`CONFIG_ENV`]. A directory resolves to
/// `<dir>/config.json`. Returns `None` when neither is given.
pub fn resolve_settings_path(explicit: Option<&Path>) -> Option<PathBuf> {
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(|| read_env_string(CONFIG_ENV).map(PathBuf::from))?;
    if path.is_dir() {
        Some(path.join(CONFIG_FILE_NAME))
    } else {
        Some(path)
    }
}

/// Load settings from an optional explicit path, falling back to
/// [`CONFIG_ENV`] and then to defaults, with env var overrides applied.
pub fn load_settings(explicit: Option<&Path>) -> Result<FanoutSettings> {
    match resolve_settings_path(explicit) {
        Some(path) => load_settings_from_path(&path),
        None => {
            debug!("no config file given, using defaults");
            finish(serde_json::to_value(FanoutSettings::default())?)
        }
    }
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<FanoutSettings> {
    let defaults = serde_json::to_value(FanoutSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    finish(merged)
}

fn finish(merged: Value) -> Result<FanoutSettings> {
    let mut settings: FanoutSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Out-of-range or unparsable values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut FanoutSettings) {
    apply_overrides_with(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup. Used by [`apply_env_overrides`].
pub fn apply_overrides_with<F>(settings: &mut FanoutSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Listeners ───────────────────────────────────────────────────
    if let Some(v) = env.u16("FANOUT_SOCKET_PORT", 1, 65535) {
        settings.socket.port = v;
    }
    if let Some(v) = env.u16("FANOUT_SERVICE_PORT", 1, 65535) {
        settings.service.port = v;
    }
    if let Some(v) = env.string("FANOUT_TLS_CERT") {
        settings.service.tls_cert_path = Some(PathBuf::from(v));
    }
    if let Some(v) = env.string("FANOUT_TLS_KEY") {
        settings.service.tls_key_path = Some(PathBuf::from(v));
    }

    // ── Connections ─────────────────────────────────────────────────
    if let Some(v) = env.u64("FANOUT_HEARTBEAT_INTERVAL_SECS", 1, 86_400) {
        settings.socket.heartbeat_interval_secs = v;
    }
    if let Some(v) = env.usize("FANOUT_MAX_JOIN_ROOM", 1, 10_000) {
        settings.socket.max_join_room = v;
    }

    // ── Pipeline ────────────────────────────────────────────────────
    if let Some(v) = env.usize("FANOUT_SHARD_COUNT", 1, 4096) {
        settings.registry.shard_count = v;
    }
    if let Some(v) = env.usize("FANOUT_MERGE_WORKER_COUNT", 1, 1024) {
        settings.merge.worker_count = v;
    }
    if let Some(v) = env.u64("FANOUT_MERGE_MAX_DELAY_MS", 1, 60_000) {
        settings.merge.max_delay_ms = v;
    }
    if let Some(v) = env.usize("FANOUT_MERGE_MAX_BATCH_SIZE", 1, 100_000) {
        settings.merge.max_batch_size = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("FANOUT_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.lookup)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"socket": {"port": 7777, "host": "0.0.0.0"}});
        let source = serde_json::json!({"socket": {"port": 9000}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["socket"]["port"], 9000);
        assert_eq!(merged["socket"]["host"], "0.0.0.0");
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1});
        let source = serde_json::json!({"a": null});
        assert_eq!(deep_merge(target, source)["a"], 1);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"a": [1, 2, 3]});
        let source = serde_json::json!({"a": [9]});
        assert_eq!(deep_merge(target, source)["a"], serde_json::json!([9]));
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"b": 1}});
        let source = serde_json::json!({"a": 5});
        assert_eq!(deep_merge(target, source)["a"], 5);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let path = Path::new("/nonexistent/fanout/config.json");
        let settings = load_settings_from_path(path).unwrap();
        assert_eq!(settings.merge, FanoutSettings::default().merge);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"registry": {"shardCount": 4}, "merge": {"maxBatchSize": 3}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.registry.shard_count, 4);
        assert_eq!(settings.merge.max_batch_size, 3);
        assert_eq!(settings.registry.dispatch_worker_count, 16);
        assert_eq!(settings.merge.max_delay_ms, 300);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not valid json").unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::Json(_)));
    }

    #[test]
    fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"merge": {"workerCount": 0}}"#).unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::InvalidValue(_)));
    }

    #[test]
    fn directory_resolves_to_config_json() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_settings_path(Some(dir.path())).unwrap();
        assert_eq!(resolved, dir.path().join(CONFIG_FILE_NAME));

        let file = dir.path().join("custom.json");
        assert_eq!(resolve_settings_path(Some(&file)).unwrap(), file);
    }

    #[test]
    fn load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{"socket": {"maxJoinRoom": 2}}"#,
        )
        .unwrap();
        let settings = load_settings(Some(dir.path())).unwrap();
        assert_eq!(settings.socket.max_join_room, 2);
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn overrides_apply() {
        let mut settings = FanoutSettings::default();
        apply_overrides_with(
            &mut settings,
            lookup(&[
                ("FANOUT_SOCKET_PORT", "9001"),
                ("FANOUT_SHARD_COUNT", "4"),
                ("FANOUT_MERGE_MAX_DELAY_MS", "50"),
                ("FANOUT_TLS_CERT", "/etc/fanout/cert.pem"),
                ("FANOUT_LOG_LEVEL", "debug"),
            ]),
        );
        assert_eq!(settings.socket.port, 9001);
        assert_eq!(settings.registry.shard_count, 4);
        assert_eq!(settings.merge.max_delay_ms, 50);
        assert_eq!(
            settings.service.tls_cert_path,
            Some(PathBuf::from("/etc/fanout/cert.pem"))
        );
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn invalid_overrides_ignored() {
        let mut settings = FanoutSettings::default();
        apply_overrides_with(
            &mut settings,
            lookup(&[
                ("FANOUT_SOCKET_PORT", "0"),
                ("FANOUT_SHARD_COUNT", "lots"),
                ("FANOUT_MAX_JOIN_ROOM", "-1"),
                ("FANOUT_LOG_LEVEL", ""),
            ]),
        );
        assert_eq!(settings, FanoutSettings::default());
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u64_range("abc", 0, 10), None);
        assert_eq!(parse_u64_range("11", 0, 10), None);
        assert_eq!(parse_usize_range("5", 1, 10), Some(5));
    }
}
