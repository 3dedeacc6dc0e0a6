//! Engine configuration.
//!
//! All knobs have production defaults; deserializing a partial document fills
//! the rest from [`EngineConfig::default`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;
const HOUR_MS: u64 = 60 * 60 * 1000;

/// Tunables for the session engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rotate the outbound group session after this many messages.
    pub rotation_period_msgs: u64,
    /// Rotate the outbound group session once it is this old (milliseconds).
    pub rotation_period_ms: u64,
    /// Minimum gap between two forced pairwise refreshes for one device.
    pub wedge_rate_limit_ms: u64,
    /// Integrity failures on a known session before a device counts as wedged.
    pub wedge_failure_threshold: u32,
    /// Number of published one-time keys to maintain on the directory.
    pub one_time_key_target: usize,
    /// PBKDF2 rounds for room key export files.
    pub export_rounds: u32,
    /// Backoff and timeout for directory calls.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rotation_period_msgs: 100,
            rotation_period_ms: 7 * DAY_MS,
            wedge_rate_limit_ms: HOUR_MS,
            wedge_failure_threshold: 1,
            one_time_key_target: 50,
            export_rounds: olmstead_crypto::DEFAULT_EXPORT_ROUNDS,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Group session lifetime as a [`Duration`].
    pub fn rotation_period(&self) -> Duration {
        Duration::from_millis(self.rotation_period_ms)
    }

    /// Forced-refresh rate limit as a [`Duration`].
    pub fn wedge_rate_limit(&self) -> Duration {
        Duration::from_millis(self.wedge_rate_limit_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_rotation_policy() {
        let config = EngineConfig::default();
        assert_eq!(config.rotation_period_msgs, 100);
        assert_eq!(config.rotation_period(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.wedge_rate_limit(), Duration::from_secs(3600));
    }

    #[test]
    fn partial_document_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"rotation_period_msgs": 5}"#).unwrap();
        assert_eq!(config.rotation_period_msgs, 5);
        assert_eq!(config.one_time_key_target, 50);
        assert_eq!(config.retry, RetryPolicy::default());
    }
}
