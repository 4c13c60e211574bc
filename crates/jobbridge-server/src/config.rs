//! Runtime configuration for the gateway server.

use std::time::Duration;

use jobbridge_rpc::{MethodRegistry, ParamRules};
use jobbridge_settings::GatewaySettings;

use crate::correlation::CorrelationConfig;

/// Resolved server configuration (settings converted to runtime types).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Time allowed for a first-frame credential.
    pub handshake_timeout: Duration,
    /// Time between heartbeat probes.
    pub heartbeat_interval: Duration,
    /// Time a probe may go unanswered.
    pub heartbeat_grace: Duration,
    /// Outbound frames buffered per connection.
    pub outbound_buffer_frames: usize,
    /// Malformed frames tolerated per window.
    pub malformed_frame_limit: u32,
    /// Malformed-frame window.
    pub malformed_frame_window: Duration,
    /// Subscription lifetimes.
    pub correlation: CorrelationConfig,
    /// Time between correlation sweeps.
    pub sweep_interval: Duration,
    /// Prefix of per-job event channels.
    pub channel_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 10_000,
            max_message_size: 1_048_576,
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_grace: Duration::from_secs(10),
            outbound_buffer_frames: 256,
            malformed_frame_limit: 20,
            malformed_frame_window: Duration::from_secs(60),
            correlation: CorrelationConfig::default(),
            sweep_interval: Duration::from_secs(5),
            channel_prefix: "jobbridge:job:".into(),
        }
    }
}

impl ServerConfig {
    /// Convert loaded settings into runtime configuration.
    pub fn from_settings(settings: &GatewaySettings) -> Self {
        let ms = Duration::from_millis;
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_connections: settings.server.max_connections,
            max_message_size: settings.server.max_message_size,
            handshake_timeout: ms(settings.server.handshake_timeout_ms),
            heartbeat_interval: ms(settings.heartbeat.interval_ms),
            heartbeat_grace: ms(settings.heartbeat.grace_ms),
            outbound_buffer_frames: settings.connection.outbound_buffer_frames,
            malformed_frame_limit: settings.connection.malformed_frame_limit,
            malformed_frame_window: ms(settings.connection.malformed_frame_window_ms),
            correlation: CorrelationConfig {
                max_wait: ms(settings.subscriptions.max_wait_ms),
                abandoned_ttl: ms(settings.subscriptions.abandoned_ttl_ms),
                prune_abandoned_immediately: settings.subscriptions.prune_abandoned_immediately,
            },
            sweep_interval: ms(settings.subscriptions.sweep_interval_ms),
            channel_prefix: settings.backend.channel_prefix.clone(),
        }
    }
}

/// Build the method capability table from the `methods` settings.
pub fn method_registry(settings: &GatewaySettings) -> MethodRegistry {
    let mut registry = MethodRegistry::new();
    for (name, rules) in &settings.methods.0 {
        registry.register(
            name,
            ParamRules {
                required: rules.required_params.clone(),
                max_params_bytes: rules.max_params_bytes,
            },
        );
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobbridge_settings::MethodSettings;

    #[test]
    fn default_port_is_zero() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.host, "127.0.0.1");
    }

    #[test]
    fn from_settings_converts_durations() {
        let mut settings = GatewaySettings::default();
        settings.heartbeat.interval_ms = 1_500;
        settings.subscriptions.max_wait_ms = 90_000;
        settings.subscriptions.prune_abandoned_immediately = true;
        settings.backend.channel_prefix = "jobs:".into();

        let cfg = ServerConfig::from_settings(&settings);
        assert_eq!(cfg.port, 8787);
        assert_eq!(cfg.heartbeat_interval, Duration::from_millis(1_500));
        assert_eq!(cfg.heartbeat_grace, Duration::from_secs(10));
        assert_eq!(cfg.correlation.max_wait, Duration::from_secs(90));
        assert!(cfg.correlation.prune_abandoned_immediately);
        assert_eq!(cfg.channel_prefix, "jobs:");
        assert_eq!(cfg.outbound_buffer_frames, 256);
    }

    #[test]
    fn method_registry_from_settings() {
        let mut settings = GatewaySettings::default();
        let _ = settings.methods.0.insert(
            "data.process".into(),
            MethodSettings {
                required_params: vec!["input".into()],
                max_params_bytes: 1024,
            },
        );
        let registry = method_registry(&settings);
        assert_eq!(registry.methods(), vec!["data.process", "echo"]);
    }
}
