//! Runtime configuration for the server and the broker.
//!
//! Both structs are plain values built from [`DuelSettings`]; nothing in
//! this crate reads the environment or the settings file directly.

use std::time::Duration;

use duel_settings::DuelSettings;

/// Network and per-connection configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Interval between keepalive pings on every connection.
    pub keepalive_interval: Duration,
    /// Peer silence tolerated before the connection is dropped.
    pub pong_timeout: Duration,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            keepalive_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
            send_queue_capacity: 32,
            max_message_size: 64 * 1024,
        }
    }
}

impl From<&DuelSettings> for ServerConfig {
    fn from(settings: &DuelSettings) -> Self {
        let s = &settings.server;
        Self {
            host: s.host.clone(),
            port: s.port,
            keepalive_interval: s.keepalive_interval(),
            pong_timeout: s.pong_timeout(),
            send_queue_capacity: s.send_queue_capacity,
            max_message_size: s.max_message_size,
        }
    }
}

/// Matchmaking and session supervision configuration.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Admission budget: sessions allowed to run at once.
    pub max_sessions: usize,
    /// Join requests that may wait in the queue.
    pub queue_capacity: usize,
    /// How long `request_session` waits for a reply.
    pub match_timeout: Duration,
    /// Hard deadline for a session.
    pub session_timeout: Duration,
    /// Supervisor completion poll interval.
    pub poll_interval: Duration,
    /// Stale-session sweep interval.
    pub sweep_interval: Duration,
    /// Telemetry log interval.
    pub stats_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            queue_capacity: 1000,
            match_timeout: Duration::from_secs(30),
            session_timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(60),
            stats_interval: Duration::from_secs(10),
        }
    }
}

impl From<&DuelSettings> for BrokerConfig {
    fn from(settings: &DuelSettings) -> Self {
        let mm = &settings.matchmaking;
        Self {
            max_sessions: mm.max_concurrent_sessions,
            queue_capacity: mm.queue_capacity,
            match_timeout: mm.match_timeout(),
            session_timeout: mm.session_timeout(),
            poll_interval: mm.poll_interval(),
            sweep_interval: mm.sweep_interval(),
            stats_interval: mm.stats_interval(),
        }
    }
}
