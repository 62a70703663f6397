//! Gateway tunables.
//!
//! Every knob has a serde default so a partial config file (or `{}`) yields
//! the production values. Durations are carried as milliseconds to keep the
//! wire format integer-only.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate_limit::RateLimiterConfig;

/// Default deadline for the `auth` event after upgrade.
pub const DEFAULT_AUTH_DEADLINE_MS: u64 = 10_000;
/// Default idle cutoff before the sweep closes a connection.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 300_000;
/// Default interval between inactivity sweeps.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;
/// Default typing-burst expiry.
pub const DEFAULT_TYPING_EXPIRY_MS: u64 = 3_000;
/// Default damping window for repeated `online` broadcasts.
pub const DEFAULT_PRESENCE_DAMP_MS: u64 = 5_000;
/// Default per-connection outbound queue capacity.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;
/// Default lifetime drop budget before a slow consumer is disconnected.
pub const DEFAULT_MAX_SEND_DROPS: u64 = 100;
/// Default upper bound on chat message bodies, in bytes.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 4096;

/// Gateway configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// How long an upgraded connection may sit unauthenticated (ms).
    #[serde(default = "default_auth_deadline_ms")]
    pub auth_deadline_ms: u64,
    /// Idle cutoff enforced by the sweep (ms).
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Interval between inactivity sweeps (ms).
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Silence after the last typing signal before `typing: false` (ms).
    #[serde(default = "default_typing_expiry_ms")]
    pub typing_expiry_ms: u64,
    /// Window during which repeated `online` broadcasts are suppressed (ms).
    #[serde(default = "default_presence_damp_ms")]
    pub presence_damp_ms: u64,
    /// Bounded capacity of each connection's outbound queue.
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
    /// Lifetime drops tolerated before a slow consumer is disconnected.
    #[serde(default = "default_max_send_drops")]
    pub max_send_drops: u64,
    /// Upper bound on chat message bodies, in bytes.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Per-user budget for gateway events.
    #[serde(default = "RateLimiterConfig::gateway")]
    pub event_rate: RateLimiterConfig,
}

fn default_auth_deadline_ms() -> u64 {
    DEFAULT_AUTH_DEADLINE_MS
}
fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}
fn default_sweep_interval_ms() -> u64 {
    DEFAULT_SWEEP_INTERVAL_MS
}
fn default_typing_expiry_ms() -> u64 {
    DEFAULT_TYPING_EXPIRY_MS
}
fn default_presence_damp_ms() -> u64 {
    DEFAULT_PRESENCE_DAMP_MS
}
fn default_send_queue_capacity() -> usize {
    DEFAULT_SEND_QUEUE_CAPACITY
}
fn default_max_send_drops() -> u64 {
    DEFAULT_MAX_SEND_DROPS
}
fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            auth_deadline_ms: DEFAULT_AUTH_DEADLINE_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            typing_expiry_ms: DEFAULT_TYPING_EXPIRY_MS,
            presence_damp_ms: DEFAULT_PRESENCE_DAMP_MS,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            max_send_drops: DEFAULT_MAX_SEND_DROPS,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            event_rate: RateLimiterConfig::gateway(),
        }
    }
}

impl GatewayConfig {
    /// Deadline for the `auth` event.
    #[must_use]
    pub const fn auth_deadline(&self) -> Duration {
        Duration::from_millis(self.auth_deadline_ms)
    }

    /// Idle cutoff for the sweep.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Interval between sweeps.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Typing-burst expiry.
    #[must_use]
    pub const fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }

    /// Online-broadcast damping window.
    #[must_use]
    pub const fn presence_damp(&self) -> Duration {
        Duration::from_millis(self.presence_damp_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let config = GatewayConfig::default();
        assert_eq!(config.auth_deadline(), Duration::from_secs(10));
        assert_eq!(config.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.typing_expiry(), Duration::from_secs(3));
        assert_eq!(config.presence_damp(), Duration::from_secs(5));
        assert_eq!(config.send_queue_capacity, 256);
        assert_eq!(config.max_send_drops, 100);
        assert_eq!(config.event_rate.limit, 120);
    }

    #[test]
    fn empty_json_yields_defaults() {
        let config: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.idle_timeout_ms, DEFAULT_IDLE_TIMEOUT_MS);
        assert_eq!(config.event_rate.limit, 120);
    }

    #[test]
    fn partial_json_overrides_one_field() {
        let config: GatewayConfig = serde_json::from_str(r#"{"idleTimeoutMs":1000}"#).unwrap();
        assert_eq!(config.idle_timeout_ms, 1000);
        assert_eq!(config.sweep_interval_ms, DEFAULT_SWEEP_INTERVAL_MS);
    }
}
