//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Call once at startup
/// before any metric is recorded.
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

/// WebSocket connections registered (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket connections removed from the registry (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live registered connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Join requests submitted (counter).
pub const MATCHMAKING_REQUESTS_TOTAL: &str = "matchmaking_requests_total";
/// Join requests that failed (counter, labels: reason).
pub const MATCHMAKING_FAILURES_TOTAL: &str = "matchmaking_failures_total";
/// Join requests waiting in the queue (gauge).
pub const MATCHMAKING_QUEUE_DEPTH: &str = "matchmaking_queue_depth";
/// Sessions admitted (counter).
pub const SESSIONS_STARTED_TOTAL: &str = "sessions_started_total";
/// Sessions retired (counter, labels: outcome).
pub const SESSIONS_ENDED_TOTAL: &str = "sessions_ended_total";
/// Sessions currently holding an admission token (gauge).
pub const SESSIONS_ACTIVE: &str = "sessions_active";
/// Admission tokens not held by any session (gauge).
pub const ADMISSION_TOKENS_AVAILABLE: &str = "admission_tokens_available";
