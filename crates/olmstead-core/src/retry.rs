//! Bounded exponential backoff with per-attempt timeouts.
//!
//! Used for every network-bound suboperation (one-time key claims, key
//! uploads). Decryption and integrity failures never go through here.

use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::env::Environment;

/// Errors that know whether another attempt may help.
pub trait Retryable: Sized {
    /// Whether the same call may succeed later.
    fn is_transient(&self) -> bool;

    /// Error produced when one attempt exceeded the timeout.
    fn timed_out(after: Duration) -> Self;
}

/// Retry budget for one logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt (milliseconds).
    pub base_delay_ms: u64,
    /// Upper bound for any single delay (milliseconds).
    pub max_delay_ms: u64,
    /// Timeout for each attempt (milliseconds).
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 4, base_delay_ms: 250, max_delay_ms: 8_000, timeout_ms: 10_000 }
    }
}

impl RetryPolicy {
    /// No retries, for callers that report failures immediately.
    pub fn once(timeout: Duration) -> Self {
        Self { max_attempts: 1, base_delay_ms: 0, max_delay_ms: 0, timeout_ms: timeout.as_millis() as u64 }
    }

    /// Delay after failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Run `op` until it succeeds, fails permanently, or the budget runs out.
///
/// Each attempt is bounded by the policy timeout; a timeout counts as a
/// transient failure. Returns the last error once attempts are exhausted.
pub async fn with_backoff<E, T, Fail, F, Fut>(
    env: &E,
    policy: &RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, Fail>
where
    E: Environment,
    Fail: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Fail>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let result = match tokio::time::timeout(policy.timeout(), op()).await {
            Ok(result) => result,
            Err(_) => Err(Fail::timed_out(policy.timeout())),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < attempts => {
                let delay = policy.delay_for(attempt);
                debug!(operation, attempt, ?delay, error = %err, "transient failure, backing off");
                env.sleep(delay).await;
                attempt += 1;
            },
            Err(err) => {
                warn!(operation, attempts = attempt + 1, error = %err, "giving up");
                return Err(err);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    };

    use super::*;

    #[derive(Clone, Default)]
    struct TestEnv {
        slept_ms: Arc<AtomicU64>,
    }

    impl Environment for TestEnv {
        fn now_millis(&self) -> u64 {
            0
        }

        fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
            self.slept_ms.fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
            async {}
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(7);
        }
    }

    #[derive(Debug, PartialEq)]
    enum TestError {
        Flaky,
        Fatal,
        TimedOut,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, Self::Flaky | Self::TimedOut)
        }

        fn timed_out(_after: Duration) -> Self {
            Self::TimedOut
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy { max_attempts: 10, base_delay_ms: 100, max_delay_ms: 1000, timeout_ms: 1 };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(70), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let env = TestEnv::default();
        let calls = AtomicU32::new(0);

        let result = with_backoff(&env, &RetryPolicy::default(), "claim", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err(TestError::Flaky) } else { Ok(n) } }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(env.slept_ms.load(Ordering::SeqCst), 250 + 500);
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_last_error() {
        let env = TestEnv::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_backoff(&env, &RetryPolicy::default(), "claim", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Flaky) }
        })
        .await;

        assert_eq!(result, Err(TestError::Flaky));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let env = TestEnv::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_backoff(&env, &RetryPolicy::default(), "upload", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Fatal) }
        })
        .await;

        assert_eq!(result, Err(TestError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hung_attempt_times_out() {
        let env = TestEnv::default();
        let policy = RetryPolicy { max_attempts: 2, base_delay_ms: 1, max_delay_ms: 1, timeout_ms: 10 };

        let result: Result<(), _> =
            with_backoff(&env, &policy, "claim", || std::future::pending::<Result<(), TestError>>()).await;

        assert_eq!(result, Err(TestError::TimedOut));
    }
}
