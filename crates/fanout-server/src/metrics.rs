//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Frames dropped on a full outbound queue (counter).
pub const WS_OUTBOUND_DROPS_TOTAL: &str = "ws_outbound_drops_total";
/// Connections closed by the heartbeat check (counter).
pub const WS_HEARTBEAT_TIMEOUTS_TOTAL: &str = "ws_heartbeat_timeouts_total";
/// Pushes rejected by a full dispatch queue (counter).
pub const REGISTRY_DISPATCH_DROPS_TOTAL: &str = "registry_dispatch_drops_total";
/// Shards skipped for one push because their queue was saturated (counter).
pub const REGISTRY_SHARD_SKIPS_TOTAL: &str = "registry_shard_skips_total";
/// Items rejected by a full merge queue (counter).
pub const MERGE_DROPS_TOTAL: &str = "merge_drops_total";
/// Batches handed to the registry (counter, labels: trigger).
pub const MERGE_BATCHES_TOTAL: &str = "merge_batches_total";
/// Expiry timers that fired for an already-committed batch (counter).
pub const MERGE_STALE_TIMERS_TOTAL: &str = "merge_stale_timers_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_render() {
        // Build a recorder + handle (no global install to avoid test conflicts).
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_OUTBOUND_DROPS_TOTAL,
            WS_HEARTBEAT_TIMEOUTS_TOTAL,
            REGISTRY_DISPATCH_DROPS_TOTAL,
            REGISTRY_SHARD_SKIPS_TOTAL,
            MERGE_DROPS_TOTAL,
            MERGE_BATCHES_TOTAL,
            MERGE_STALE_TIMERS_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
