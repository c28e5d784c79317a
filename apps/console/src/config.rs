use std::time::Duration;

use tracing::warn;

use helm_proto::codec::{CodecConfig, DEFAULT_CHUNK_THRESHOLD};

use crate::gateway::config::DEFAULT_AUTH_TIMEOUT;
use crate::peer::{DEFAULT_RECONNECT_BACKOFF, DEFAULT_SEND_SETTLE, PeerChannelConfig};
use crate::subscription::{DEFAULT_PACING, DEFAULT_SETTLE, DEFAULT_THROTTLE_MS};

/// Tunables for the console core. Env overrides use the `HELM_` prefix;
/// unparseable values fall back to the default with a warning.
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    pub gateway_url: String,
    pub gateway_realm: String,
    pub auth_timeout: Duration,
    pub peer_base_url: String,
    pub chunk_threshold: usize,
    pub reconnect_backoff: Duration,
    pub send_settle: Duration,
    pub subscription_settle: Duration,
    pub subscription_pacing: Duration,
    pub subscribe_throttle_ms: u64,
    pub confirm_settle: Duration,
    pub low_battery_threshold: f32,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            gateway_url: "ws://127.0.0.1:9020".to_string(),
            gateway_realm: "fleet".to_string(),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            peer_base_url: "ws://127.0.0.1:9030/robots".to_string(),
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            send_settle: DEFAULT_SEND_SETTLE,
            subscription_settle: DEFAULT_SETTLE,
            subscription_pacing: DEFAULT_PACING,
            subscribe_throttle_ms: DEFAULT_THROTTLE_MS,
            confirm_settle: crate::flow::orchestrator::DEFAULT_CONFIRM_SETTLE,
            low_battery_threshold: crate::flow::orchestrator::DEFAULT_LOW_BATTERY_THRESHOLD,
        }
    }
}

impl ConsoleConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            gateway_url: string_env("HELM_GATEWAY_URL", defaults.gateway_url),
            gateway_realm: string_env("HELM_GATEWAY_REALM", defaults.gateway_realm),
            auth_timeout: millis_env("HELM_AUTH_TIMEOUT_MS", defaults.auth_timeout),
            peer_base_url: string_env("HELM_PEER_URL", defaults.peer_base_url),
            chunk_threshold: usize_env("HELM_CHUNK_THRESHOLD", defaults.chunk_threshold, 64),
            reconnect_backoff: millis_env("HELM_RECONNECT_BACKOFF_MS", defaults.reconnect_backoff),
            send_settle: millis_env("HELM_SEND_SETTLE_MS", defaults.send_settle),
            subscription_settle: millis_env(
                "HELM_SUBSCRIPTION_SETTLE_MS",
                defaults.subscription_settle,
            ),
            subscription_pacing: millis_env(
                "HELM_SUBSCRIPTION_PACING_MS",
                defaults.subscription_pacing,
            ),
            subscribe_throttle_ms: u64_env(
                "HELM_SUBSCRIBE_THROTTLE_MS",
                defaults.subscribe_throttle_ms,
            ),
            confirm_settle: millis_env("HELM_CONFIRM_SETTLE_MS", defaults.confirm_settle),
            low_battery_threshold: defaults.low_battery_threshold,
        }
    }

    pub fn peer_channel_config(&self) -> PeerChannelConfig {
        PeerChannelConfig {
            reconnect_backoff: self.reconnect_backoff,
            send_settle: self.send_settle,
            codec: CodecConfig {
                chunk_threshold: self.chunk_threshold,
            },
        }
    }
}

fn string_env(var: &str, default: String) -> String {
    std::env::var(var).unwrap_or(default)
}

fn usize_env(var: &str, default: usize, min: usize) -> usize {
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(var, parsed, min, default, "value below minimum; using default");
                default
            }
            Err(err) => {
                warn!(var, error = %err, default, "failed to parse env; using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn u64_env(var: &str, default: u64) -> u64 {
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<u64>() {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(var, error = %err, default, "failed to parse env; using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn millis_env(var: &str, default: Duration) -> Duration {
    Duration::from_millis(u64_env(var, default.as_millis() as u64))
}
