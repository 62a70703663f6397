//! Prometheus metrics recorder and metric-name constants.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at server startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

/// Render Prometheus text format from the installed recorder.
#[must_use]
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across crates.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Broadcast drops total (counter).
pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
/// WebSocket connection duration seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Authentication failures total (counter, labels: code).
pub const AUTH_FAILURES_TOTAL: &str = "auth_failures_total";
/// Chat messages persisted and broadcast total (counter).
pub const CHAT_MESSAGES_TOTAL: &str = "chat_messages_total";
/// Typing bursts started total (counter).
pub const TYPING_BURSTS_TOTAL: &str = "typing_bursts_total";
/// Events dropped by the rate limiter total (counter).
pub const RATE_LIMITED_TOTAL: &str = "rate_limited_total";
/// Presence broadcasts total (counter, labels: status).
pub const PRESENCE_BROADCASTS_TOTAL: &str = "presence_broadcasts_total";
/// Connections closed by the inactivity sweep total (counter).
pub const IDLE_SWEEP_CLOSES_TOTAL: &str = "idle_sweep_closes_total";
