//! Failure policies and exponential backoff for the engine loops.
//!
//! Backoff formula: min(max_delay, base_delay * 2^attempt) + jitter

use crate::ErrorKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a loop does after a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop the loop and return the failure
    Terminate,
    /// Report the failure and keep going
    Continue,
}

impl FailurePolicy {
    /// Whether a failure of `kind` ends the loop under this policy.
    /// Fatal kinds end it whatever the policy.
    pub fn stops_on(&self, kind: ErrorKind) -> bool {
        kind.is_fatal() || *self == FailurePolicy::Terminate
    }
}

/// Backoff between retried polls.
///
/// The n-th consecutive poll failure waits `base_delay * 2^(n-1)`, capped at
/// `max_delay`. The loop stops once failures exceed `max_retries`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed polls tolerated before the loop stops
    pub max_retries: u32,
    /// Spread each delay by up to a quarter in either direction
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(30), 10)
    }
}

impl RetryConfig {
    /// Backoff with jitter enabled.
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
            jitter: true,
        }
    }

    /// Exact delays, for deterministic pacing in tests.
    pub fn without_jitter(self) -> Self {
        Self {
            jitter: false,
            ..self
        }
    }

    /// Whether another retry is allowed after `failures` consecutive failures.
    pub fn allows_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(20);
        let capped = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let capped_ms = capped.as_millis() as u64;
        let spread = capped_ms / 4;
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u64;
        Duration::from_millis(capped_ms - spread + seed % (spread * 2 + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.base_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_retries, 10);
        assert!(config.jitter);
    }

    #[test]
    fn test_calculate_delay_exponential() {
        let config = RetryConfig::new(Duration::from_millis(100), Duration::from_secs(30), 10)
            .without_jitter();

        assert_eq!(config.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(config.calculate_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_calculate_delay_caps_at_max() {
        let config = RetryConfig::new(Duration::from_millis(100), Duration::from_secs(1), 10)
            .without_jitter();

        assert_eq!(config.calculate_delay(10), Duration::from_millis(1000));
        assert_eq!(config.calculate_delay(50), Duration::from_millis(1000));
    }

    #[test]
    fn test_calculate_delay_with_jitter() {
        let config = RetryConfig::new(Duration::from_millis(1000), Duration::from_secs(30), 10);

        let delay = config.calculate_delay(0);
        assert!(delay >= Duration::from_millis(750), "delay {:?} too short", delay);
        assert!(delay <= Duration::from_millis(1250), "delay {:?} too long", delay);
    }

    #[test]
    fn test_failure_policy_stops_on_fatal_kinds() {
        assert!(FailurePolicy::Terminate.stops_on(ErrorKind::Poll));
        assert!(!FailurePolicy::Continue.stops_on(ErrorKind::Poll));
        assert!(!FailurePolicy::Continue.stops_on(ErrorKind::Dispatch));
        assert!(FailurePolicy::Continue.stops_on(ErrorKind::Connection));
        assert!(FailurePolicy::Continue.stops_on(ErrorKind::Auth));
    }

    #[test]
    fn test_allows_retry() {
        let config = RetryConfig::new(Duration::from_millis(1), Duration::from_millis(10), 2);
        assert!(config.allows_retry(1));
        assert!(config.allows_retry(2));
        assert!(!config.allows_retry(3));

        let never = RetryConfig::new(Duration::from_millis(1), Duration::from_millis(10), 0);
        assert!(!never.allows_retry(1));
    }
}
