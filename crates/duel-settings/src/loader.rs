//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`DuelSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply environment variable overrides (highest priority)
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
use crate::types::DuelSettings;

/// Resolve the path to the settings file (`~/.duel/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".duel").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<DuelSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields the defaults. Invalid JSON or values that fail
/// [`DuelSettings::validate`] are errors.
pub fn load_settings_from_path(path: &Path) -> Result<DuelSettings> {
    let defaults = serde_json::to_value(DuelSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: DuelSettings = serde_json::from_value(merged)?;
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

/// Apply `DUEL_*` environment variable overrides.
///
/// Integers must parse and fall inside the stated range; anything else is
/// ignored with a warning.
pub fn apply_env_overrides(settings: &mut DuelSettings) {
    if let Some(v) = read_env_string("DUEL_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("DUEL_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_u64("DUEL_KEEPALIVE_MS", 1_000, 600_000) {
        settings.server.keepalive_interval_ms = v;
    }
    if let Some(v) = read_env_u64("DUEL_PONG_TIMEOUT_MS", 2_000, 3_600_000) {
        settings.server.pong_timeout_ms = v;
    }
    if let Some(v) = read_env_usize("DUEL_MAX_SESSIONS", 1, 100_000) {
        settings.matchmaking.max_concurrent_sessions = v;
    }
    if let Some(v) = read_env_usize("DUEL_QUEUE_CAPACITY", 1, 1_000_000) {
        settings.matchmaking.queue_capacity = v;
    }
    if let Some(v) = read_env_u64("DUEL_MATCH_TIMEOUT_MS", 100, 3_600_000) {
        settings.matchmaking.match_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("DUEL_SESSION_TIMEOUT_MS", 1_000, 86_400_000) {
        settings.matchmaking.session_timeout_ms = v;
    }
    if let Some(v) = read_env_string("DUEL_LOG_LEVEL") {
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

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}
