//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live registered connections.
    pub connections: usize,
    /// Sessions holding an admission token.
    pub active_sessions: usize,
}

/// Build a health response. `start_time` is the process start instant owned
/// by the server.
pub fn health_check(start_time: Instant, connections: usize, sessions: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        active_sessions: sessions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), 0, 0);
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_counts_from_start() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(90))
            .unwrap();
        let resp = health_check(start, 0, 0);
        assert!(resp.uptime_secs >= 89);
    }

    #[test]
    fn serialization() {
        let resp = health_check(Instant::now(), 4, 2);
        let parsed = serde_json::to_value(&resp).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 4);
        assert_eq!(parsed["active_sessions"], 2);
        assert!(parsed["uptime_secs"].is_number());
    }
}
