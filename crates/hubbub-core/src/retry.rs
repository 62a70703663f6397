//! Reconnect policy and backoff calculation.
//!
//! The portable, sync-only math for client reconnects. The async loop that
//! uses it lives in `hubbub-client`; keeping the schedule here makes it a
//! pure function the tests can pin down exactly.

use serde::{Deserialize, Serialize};

/// Default bounded retry budget.
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default maximum delay between retries in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Reconnect behavior after an abnormal close.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Maximum number of reconnect attempts before giving up (default: 5).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff in ms (default: 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay between attempts in ms (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), in milliseconds.
    ///
    /// Doubles from the base each attempt and caps at `max_delay_ms`:
    /// with the defaults the first three retries wait 2 s, 4 s and 8 s.
    #[must_use]
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(1u64 << attempt.min(31))
            .min(self.max_delay_ms)
    }

    /// Whether attempt `attempt` (1-based) is within the retry budget.
    #[must_use]
    pub const fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 30_000);
    }

    #[test]
    fn schedule_doubles_from_base() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_ms(1), 2000);
        assert_eq!(policy.delay_ms(2), 4000);
        assert_eq!(policy.delay_ms(3), 8000);
        assert_eq!(policy.delay_ms(4), 16_000);
    }

    #[test]
    fn schedule_caps_at_max() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_ms(5), 30_000);
        assert_eq!(policy.delay_ms(30), 30_000);
    }

    #[test]
    fn high_attempt_does_not_overflow() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_ms(u32::MAX), 30_000);
    }

    #[test]
    fn budget_is_bounded() {
        let policy = ReconnectPolicy::default();
        assert!(policy.allows(1));
        assert!(policy.allows(5));
        assert!(!policy.allows(6));
    }

    #[test]
    fn serde_defaults_fill_missing_fields() {
        let policy: ReconnectPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay_ms, 1000);

        let policy: ReconnectPolicy =
            serde_json::from_str(r#"{"maxRetries":2,"baseDelayMs":10}"#).unwrap();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.base_delay_ms, 10);
        assert_eq!(policy.max_delay_ms, 30_000);
    }
}
