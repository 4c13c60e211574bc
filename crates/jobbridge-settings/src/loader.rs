//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`GatewaySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `JOBBRIDGE_*` environment overrides
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{BackendKind, GatewaySettings};

/// Resolve the default settings path (`~/.jobbridge/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".jobbridge").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<GatewaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<GatewaySettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<GatewaySettings> {
    let defaults = serde_json::to_value(GatewaySettings::default())?;

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

/// Apply `JOBBRIDGE_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut GatewaySettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Invalid values are ignored with a warning and fall back to the file or
/// default value.
pub fn apply_overrides_from<F>(settings: &mut GatewaySettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("JOBBRIDGE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("JOBBRIDGE_PORT", 0, 65_535) {
        settings.server.port = v;
    }
    if let Some(v) = env.usize("JOBBRIDGE_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = env.usize("JOBBRIDGE_MAX_MESSAGE_SIZE", 1024, 64 * 1_048_576) {
        settings.server.max_message_size = v;
    }
    if let Some(v) = env.u64("JOBBRIDGE_HANDSHAKE_TIMEOUT_MS", 100, 600_000) {
        settings.server.handshake_timeout_ms = v;
    }

    // ── Heartbeat / connection ──────────────────────────────────────
    if let Some(v) = env.u64("JOBBRIDGE_HEARTBEAT_INTERVAL_MS", 100, 600_000) {
        settings.heartbeat.interval_ms = v;
    }
    if let Some(v) = env.u64("JOBBRIDGE_HEARTBEAT_GRACE_MS", 100, 600_000) {
        settings.heartbeat.grace_ms = v;
    }
    if let Some(v) = env.usize("JOBBRIDGE_OUTBOUND_BUFFER", 1, 1_000_000) {
        settings.connection.outbound_buffer_frames = v;
    }
    if let Some(v) = env.u64("JOBBRIDGE_MALFORMED_LIMIT", 1, 100_000) {
        settings.connection.malformed_frame_limit = u32::try_from(v).unwrap_or(u32::MAX);
    }

    // ── Subscriptions ───────────────────────────────────────────────
    if let Some(v) = env.u64("JOBBRIDGE_MAX_WAIT_MS", 1_000, 7 * 24 * 3_600_000) {
        settings.subscriptions.max_wait_ms = v;
    }
    if let Some(v) = env.u64("JOBBRIDGE_ABANDONED_TTL_MS", 0, 24 * 3_600_000) {
        settings.subscriptions.abandoned_ttl_ms = v;
    }
    if let Some(v) = env.bool("JOBBRIDGE_PRUNE_ABANDONED") {
        settings.subscriptions.prune_abandoned_immediately = v;
    }

    // ── Backend ─────────────────────────────────────────────────────
    if let Some(raw) = env.string("JOBBRIDGE_BACKEND") {
        match BackendKind::parse(&raw) {
            Some(kind) => settings.backend.kind = kind,
            None => warn!(key = "JOBBRIDGE_BACKEND", value = %raw, "unknown backend, ignoring"),
        }
    }
    if let Some(v) = env.string("JOBBRIDGE_BACKEND_ADDRESS") {
        settings.backend.address = v;
    }

    // ── Auth ────────────────────────────────────────────────────────
    if let Some(v) = env.string("JOBBRIDGE_JWT_SECRET") {
        settings.auth.jwt_secret = v;
    }
    if let Some(v) = env.string("JOBBRIDGE_JWT_ISSUER") {
        settings.auth.issuer = Some(v);
    }
    if let Some(v) = env.string("JOBBRIDGE_JWT_AUDIENCE") {
        settings.auth.audience = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("JOBBRIDGE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("JOBBRIDGE_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

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

// ── Variable readers ────────────────────────────────────────────────────────

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

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
