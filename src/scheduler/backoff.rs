//! Retry backoff computation.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{BackoffStrategy, RetryPolicy};

/// Exponential growth factor between attempts.
const EXPONENTIAL_MULTIPLIER: f64 = 2.0;

/// Delay before re-running attempt `attempt + 1`, where `attempt` is the
/// 1-based number of the attempt that just failed.
pub fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let initial = policy.initial_delay_ms as f64;
    let delay_ms = match policy.backoff {
        BackoffStrategy::Constant => initial,
        BackoffStrategy::Linear => initial * attempt as f64,
        BackoffStrategy::Exponential => {
            initial * EXPONENTIAL_MULTIPLIER.powi(attempt as i32 - 1)
        }
    };
    Duration::from_millis((delay_ms as u64).min(policy.max_delay_ms))
}

/// When the next attempt may run, or `None` when the delay would land
/// past the task's deadline.
pub fn next_retry_at(
    policy: &RetryPolicy,
    attempt: u32,
    now: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let delay = retry_delay(policy, attempt);
    let at = now + chrono::Duration::from_std(delay).ok()?;
    match deadline {
        Some(deadline) if at > deadline => None,
        _ => Some(at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(backoff: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            backoff,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
        }
    }

    #[test]
    fn test_constant_backoff() {
        let p = policy(BackoffStrategy::Constant);
        assert_eq!(retry_delay(&p, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(&p, 5), Duration::from_millis(100));
    }

    #[test]
    fn test_linear_backoff() {
        let p = policy(BackoffStrategy::Linear);
        assert_eq!(retry_delay(&p, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(&p, 3), Duration::from_millis(300));
    }

    #[test]
    fn test_exponential_backoff() {
        let p = policy(BackoffStrategy::Exponential);
        assert_eq!(retry_delay(&p, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(&p, 2), Duration::from_millis(200));
        assert_eq!(retry_delay(&p, 3), Duration::from_millis(400));
    }

    #[test]
    fn test_max_delay_caps_growth() {
        let p = policy(BackoffStrategy::Exponential);
        assert_eq!(retry_delay(&p, 10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_retry_past_deadline_is_refused() {
        let p = policy(BackoffStrategy::Constant);
        let now = Utc::now();

        let near = now + chrono::Duration::milliseconds(50);
        assert!(next_retry_at(&p, 1, now, Some(near)).is_none());

        let far = now + chrono::Duration::seconds(10);
        assert!(next_retry_at(&p, 1, now, Some(far)).is_some());
        assert!(next_retry_at(&p, 1, now, None).is_some());
    }
}
