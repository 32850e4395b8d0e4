//! Retry decisions for failed attempts.

use std::time::Duration;

use crate::config::EngineConfig;

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue after `delay`; `attempt` is the new retry count.
    Retry {
        /// Retry count after this decision.
        attempt: u32,
        /// Flat delay before re-insertion.
        delay: Duration,
    },
    /// Budget spent (or retries disabled); the task fails.
    Exhausted,
}

/// Flat-delay retry policy. Budgets are per task, passed in at decision time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Whether failed tasks are retried at all.
    pub enabled: bool,
    /// Delay before a retried task re-enters the queue.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Policy described by the engine configuration.
    #[must_use]
    pub const fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            enabled: cfg.enable_retry,
            delay: Duration::from_millis(cfg.retry_delay_ms),
        }
    }

    /// Decide for a task that has used `retry_count` of `max_retries`.
    #[must_use]
    pub const fn decide(&self, retry_count: u32, max_retries: u32) -> RetryDecision {
        if self.enabled && retry_count < max_retries {
            RetryDecision::Retry {
                attempt: retry_count + 1,
                delay: self.delay,
            }
        } else {
            RetryDecision::Exhausted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            enabled: true,
            delay: Duration::from_millis(250),
        }
    }

    #[test]
    fn test_retries_until_budget_spent() {
        let p = policy();
        assert_eq!(
            p.decide(0, 3),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(250)
            }
        );
        assert!(matches!(p.decide(2, 3), RetryDecision::Retry { attempt: 3, .. }));
        assert_eq!(p.decide(3, 3), RetryDecision::Exhausted);
    }

    #[test]
    fn test_delay_is_flat() {
        let p = policy();
        let delays: Vec<Duration> = (0..3)
            .filter_map(|n| match p.decide(n, 3) {
                RetryDecision::Retry { delay, .. } => Some(delay),
                RetryDecision::Exhausted => None,
            })
            .collect();
        assert_eq!(delays, vec![Duration::from_millis(250); 3]);
    }

    #[test]
    fn test_disabled_or_zero_budget_never_retries() {
        let disabled = RetryPolicy {
            enabled: false,
            ..policy()
        };
        assert_eq!(disabled.decide(0, 3), RetryDecision::Exhausted);
        assert_eq!(policy().decide(0, 0), RetryDecision::Exhausted);
    }

    #[test]
    fn test_from_config() {
        let cfg = EngineConfig::default()
            .with_retry(true, 5)
            .with_retry_delay(Duration::from_millis(40));
        let p = RetryPolicy::from_config(&cfg);
        assert!(p.enabled);
        assert_eq!(p.delay, Duration::from_millis(40));
    }
}
