//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `RELAY_*` environment overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use relay_core::logging::LogFormat;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::RelaySettings;

/// Resolve the path to the settings file (`~/.relay/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON or values the
/// transport cannot run with is an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let mut settings = read_settings_file(path)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

fn read_settings_file(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
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

/// Apply `RELAY_*` overrides using `lookup` to read variables.
///
/// Invalid values are ignored with a warning, leaving the file/default
/// value in place.
pub fn apply_overrides(settings: &mut RelaySettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("RELAY_HOST") {
        settings.transport.host = v;
    }
    if let Some(v) = read("RELAY_PORT") {
        match parse_u16_range(&v, 0, u16::MAX) {
            Some(port) => settings.transport.port = port,
            None => warn!(key = "RELAY_PORT", value = %v, "invalid port env var, ignoring"),
        }
    }
    if let Some(v) = read("RELAY_LIVENESS_TIMEOUT_MS") {
        match parse_u64_range(&v, 1, 600_000) {
            Some(ms) => settings.transport.liveness_timeout_ms = ms,
            None => warn!(key = "RELAY_LIVENESS_TIMEOUT_MS", value = %v, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(v) = read("RELAY_HANDSHAKE_TIMEOUT_MS") {
        match parse_u64_range(&v, 1, 600_000) {
            Some(ms) => settings.transport.handshake_timeout_ms = ms,
            None => warn!(key = "RELAY_HANDSHAKE_TIMEOUT_MS", value = %v, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(v) = read("RELAY_MAX_MESSAGE_SIZE") {
        match parse_usize_range(&v, 1024, 1_073_741_824) {
            Some(n) => settings.transport.max_message_size = n,
            None => warn!(key = "RELAY_MAX_MESSAGE_SIZE", value = %v, "invalid usize env var, ignoring"),
        }
    }
    if let Some(v) = read("RELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("RELAY_LOG_FORMAT") {
        match LogFormat::parse(&v) {
            Some(format) => settings.logging.format = format,
            None => warn!(key = "RELAY_LOG_FORMAT", value = %v, "unknown log format, ignoring"),
        }
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

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
