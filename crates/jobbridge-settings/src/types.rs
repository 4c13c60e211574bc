//! Settings structures.
//!
//! All structs use camelCase keys and `#[serde(default)]` so a partial
//! settings file only needs the keys it changes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Listener and handshake settings.
    pub server: ServerSettings,
    /// Heartbeat probing.
    pub heartbeat: HeartbeatSettings,
    /// Per-connection limits.
    pub connection: ConnectionSettings,
    /// Correlation table timeouts.
    pub subscriptions: SubscriptionSettings,
    /// Queue and pub/sub backend.
    pub backend: BackendSettings,
    /// Credential validation.
    pub auth: AuthSettings,
    /// Log output.
    pub logging: LoggingSettings,
    /// Job methods clients may call, by name.
    pub methods: MethodTable,
}

/// Job method table. Defaults to a single `echo` method without rules.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MethodTable(pub BTreeMap<String, MethodSettings>);

impl Default for MethodTable {
    fn default() -> Self {
        let mut methods = BTreeMap::new();
        let _ = methods.insert("echo".to_owned(), MethodSettings::default());
        Self(methods)
    }
}

/// Listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks an ephemeral port).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// Time allowed for the first-frame credential.
    pub handshake_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            max_connections: 10_000,
            max_message_size: 1_048_576,
            handshake_timeout_ms: 10_000,
        }
    }
}

/// Heartbeat settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Time between probes.
    pub interval_ms: u64,
    /// Time a probe may go unanswered.
    pub grace_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            grace_ms: 10_000,
        }
    }
}

/// Per-connection limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Outbound frames buffered before the connection counts as overflowing.
    pub outbound_buffer_frames: usize,
    /// Malformed frames tolerated per window.
    pub malformed_frame_limit: u32,
    /// Length of the malformed-frame window.
    pub malformed_frame_window_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            outbound_buffer_frames: 256,
            malformed_frame_limit: 20,
            malformed_frame_window_ms: 60_000,
        }
    }
}

/// Subscription lifetime settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionSettings {
    /// Longest a job may stay non-terminal before a timeout error.
    pub max_wait_ms: u64,
    /// How long an abandoned entry is kept for late watchers.
    pub abandoned_ttl_ms: u64,
    /// Drop abandoned entries as soon as the last member leaves.
    pub prune_abandoned_immediately: bool,
    /// Time between sweeps.
    pub sweep_interval_ms: u64,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            max_wait_ms: 3_600_000,
            abandoned_ttl_ms: 60_000,
            prune_abandoned_immediately: false,
            sweep_interval_ms: 5_000,
        }
    }
}

/// Which queue / pub-sub implementation to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process queue and broker.
    #[default]
    Memory,
    /// Redis list queue and pub/sub.
    Redis,
}

impl BackendKind {
    /// Parse a backend name (case-insensitive).
    pub fn parse(val: &str) -> Option<Self> {
        match val.to_ascii_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "redis" => Some(Self::Redis),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Redis => f.write_str("redis"),
        }
    }
}

/// Backend settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendSettings {
    /// Backend implementation.
    pub kind: BackendKind,
    /// Backend address (Redis URL).
    pub address: String,
    /// Queue key jobs are pushed onto.
    pub queue_key: String,
    /// Prefix of per-job event channels.
    pub channel_prefix: String,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::Memory,
            address: "redis://127.0.0.1:6379".to_string(),
            queue_key: "jobbridge:jobs".to_string(),
            channel_prefix: "jobbridge:job:".to_string(),
        }
    }
}

/// JWT validation settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HS256 shared secret.
    pub jwt_secret: String,
    /// Required `iss` claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Required `aud` claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    /// Clock skew tolerated on `exp`.
    pub leeway_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            issuer: None,
            audience: None,
            leeway_secs: 30,
        }
    }
}

impl fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSettings")
            .field("jwt_secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("leeway_secs", &self.leeway_secs)
            .finish()
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter level when `RUST_LOG` is unset.
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

/// Rules for one job method.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MethodSettings {
    /// Parameters that must be present.
    pub required_params: Vec<String>,
    /// Cap on serialized `params`.
    pub max_params_bytes: usize,
}

impl Default for MethodSettings {
    fn default() -> Self {
        Self {
            required_params: Vec::new(),
            max_params_bytes: 65_536,
        }
    }
}

const RESERVED_METHODS: [&str; 4] = ["watch", "unwatch", "cancel", "ping"];

impl GatewaySettings {
    /// Check cross-field constraints. Called once after all layers applied.
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: impl Into<String>) -> Result<()> {
            Err(SettingsError::InvalidValue(msg.into()))
        }

        if self.auth.jwt_secret.is_empty() {
            return invalid("auth.jwtSecret must be set");
        }
        if self.server.max_connections == 0 {
            return invalid("server.maxConnections must be at least 1");
        }
        if self.server.max_message_size < 1024 {
            return invalid("server.maxMessageSize must be at least 1024");
        }
        if self.heartbeat.interval_ms == 0 || self.heartbeat.grace_ms == 0 {
            return invalid("heartbeat.intervalMs and heartbeat.graceMs must be positive");
        }
        if self.connection.outbound_buffer_frames == 0 {
            return invalid("connection.outboundBufferFrames must be at least 1");
        }
        if self.subscriptions.max_wait_ms == 0 || self.subscriptions.sweep_interval_ms == 0 {
            return invalid("subscriptions.maxWaitMs and sweepIntervalMs must be positive");
        }
        if self.backend.channel_prefix.is_empty() {
            return invalid("backend.channelPrefix must not be empty");
        }
        if self.backend.kind == BackendKind::Redis && self.backend.queue_key.is_empty() {
            return invalid("backend.queueKey must not be empty");
        }
        for name in self.methods.0.keys() {
            if name.is_empty() || RESERVED_METHODS.contains(&name.as_str()) {
                return invalid(format!("methods: '{name}' is not a valid job method name"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> GatewaySettings {
        let mut s = GatewaySettings::default();
        s.auth.jwt_secret = "secret".into();
        s
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = GatewaySettings::default();
        assert_eq!(s.server.host, "127.0.0.1");
        assert_eq!(s.server.port, 8787);
        assert_eq!(s.heartbeat.interval_ms, 30_000);
        assert_eq!(s.heartbeat.grace_ms, 10_000);
        assert_eq!(s.connection.outbound_buffer_frames, 256);
        assert_eq!(s.subscriptions.max_wait_ms, 3_600_000);
        assert_eq!(s.subscriptions.abandoned_ttl_ms, 60_000);
        assert!(!s.subscriptions.prune_abandoned_immediately);
        assert_eq!(s.backend.kind, BackendKind::Memory);
        assert_eq!(s.backend.channel_prefix, "jobbridge:job:");
        assert!(s.methods.0.contains_key("echo"));
    }

    #[test]
    fn serializes_camel_case() {
        let v = serde_json::to_value(GatewaySettings::default()).unwrap();
        assert_eq!(v["server"]["maxConnections"], 10_000);
        assert_eq!(v["subscriptions"]["pruneAbandonedImmediately"], false);
        assert_eq!(v["backend"]["kind"], "memory");
        assert_eq!(v["methods"]["echo"]["maxParamsBytes"], 65_536);
    }

    #[test]
    fn missing_secret_fails_validation() {
        let err = GatewaySettings::default().validate().unwrap_err();
        assert!(err.to_string().contains("jwtSecret"));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn zero_buffer_fails_validation() {
        let mut s = valid();
        s.connection.outbound_buffer_frames = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn reserved_method_name_fails_validation() {
        let mut s = valid();
        let _ = s.methods.0.insert("watch".into(), MethodSettings::default());
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("watch"));
    }

    #[test]
    fn backend_kind_parse() {
        assert_eq!(BackendKind::parse("Redis"), Some(BackendKind::Redis));
        assert_eq!(BackendKind::parse("memory"), Some(BackendKind::Memory));
        assert_eq!(BackendKind::parse("kafka"), None);
        assert_eq!(BackendKind::Redis.to_string(), "redis");
    }

    #[test]
    fn auth_debug_redacts_secret() {
        let mut s = valid();
        s.auth.jwt_secret = "hunter2".into();
        let dbg = format!("{:?}", s.auth);
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("<redacted>"));
    }
}
