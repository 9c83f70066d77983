use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry schedule for oracle exchanges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per expansion, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on each further attempt.
    pub base_backoff_ms: u64,
    /// Upper bound on any single delay.
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .base_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

/// Oracle client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub retry: RetryPolicy,
    /// Wall-clock limit per exchange; expiry counts as a transport failure.
    pub attempt_timeout_ms: u64,
    /// Trace markers included verbatim in a request.
    pub trace_excerpt_limit: usize,
    /// Uncovered markers suggested to the oracle per request.
    pub missing_hint_limit: usize,
}

impl OracleConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            attempt_timeout_ms: 120_000, // 2 minutes
            trace_excerpt_limit: 200,
            missing_hint_limit: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(64), Duration::from_millis(1_000));
    }
}
