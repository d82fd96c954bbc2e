//! Settings types.
//!
//! Every struct uses `#[serde(default)]` so a partial settings file only
//! needs the keys it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DuelSettings {
    /// Network and per-connection settings.
    pub server: ServerSettings,
    /// Matchmaking queue, admission budget, and session lifetime.
    pub matchmaking: MatchmakingSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl DuelSettings {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mm = &self.matchmaking;
        if mm.max_concurrent_sessions == 0 {
            return Err(SettingsError::InvalidValue(
                "maxConcurrentSessions must be at least 1".into(),
            ));
        }
        if mm.queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "queueCapacity must be at least 1".into(),
            ));
        }
        if mm.poll_interval_ms == 0 || mm.sweep_interval_ms == 0 || mm.stats_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "poll, sweep, and stats intervals must be non-zero".into(),
            ));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "sendQueueCapacity must be at least 1".into(),
            ));
        }
        if self.server.keepalive_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "keepaliveIntervalMs must be non-zero".into(),
            ));
        }
        if self.server.pong_timeout_ms <= self.server.keepalive_interval_ms {
            return Err(SettingsError::InvalidValue(
                "pongTimeoutMs must exceed keepaliveIntervalMs".into(),
            ));
        }
        Ok(())
    }
}

/// Network and per-connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Interval between keepalive pings on every connection, in milliseconds.
    pub keepalive_interval_ms: u64,
    /// Silence from a peer, in milliseconds, before its connection is
    /// dropped. Any inbound frame or pong resets it.
    pub pong_timeout_ms: u64,
    /// Outbound frames buffered per connection before writers wait.
    pub send_queue_capacity: usize,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            keepalive_interval_ms: 30_000,
            pong_timeout_ms: 60_000,
            send_queue_capacity: 32,
            max_message_size: 64 * 1024,
        }
    }
}

impl ServerSettings {
    /// Keepalive interval as a [`Duration`].
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Peer silence limit as a [`Duration`].
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }
}

/// Matchmaking queue, admission budget, and session lifetime.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchmakingSettings {
    /// Admission budget: sessions allowed to run at once.
    pub max_concurrent_sessions: usize,
    /// Join requests that may wait in the queue.
    pub queue_capacity: usize,
    /// How long a caller waits for a partner, in milliseconds.
    pub match_timeout_ms: u64,
    /// Hard deadline for a session, in milliseconds.
    pub session_timeout_ms: u64,
    /// How often a supervisor checks its game for completion.
    pub poll_interval_ms: u64,
    /// How often the stale-session sweep runs.
    pub sweep_interval_ms: u64,
    /// How often broker telemetry is logged.
    pub stats_interval_ms: u64,
}

impl Default for MatchmakingSettings {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 100,
            queue_capacity: 1000,
            match_timeout_ms: 30_000,
            session_timeout_ms: 1_800_000,
            poll_interval_ms: 1_000,
            sweep_interval_ms: 60_000,
            stats_interval_ms: 10_000,
        }
    }
}

impl MatchmakingSettings {
    /// Matchmaking reply deadline.
    pub fn match_timeout(&self) -> Duration {
        Duration::from_millis(self.match_timeout_ms)
    }

    /// Session hard deadline.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Supervisor poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Stale sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Stats sweep interval.
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}

/// Log output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
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
