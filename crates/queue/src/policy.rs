use std::time::Duration;

/// Retry bound and delay applied to failed tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Whether a delivery carrying `retry` must be discarded unprocessed.
    pub fn exhausted(&self, retry: u32) -> bool {
        retry >= self.max_attempts
    }

    pub fn next_retry(&self, retry: u32) -> u32 {
        retry.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_boundaries() {
        let policy = RetryPolicy::default();
        assert!(!policy.exhausted(0));
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
        assert!(policy.exhausted(7));
        assert_eq!(policy.backoff, Duration::from_secs(3));
    }

    #[test]
    fn test_next_retry_saturates() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_retry(2), 3);
        assert_eq!(policy.next_retry(u32::MAX), u32::MAX);
    }

    proptest! {
        #[test]
        fn prop_task_processed_exactly_max_attempts_times(max_attempts in 1u32..50) {
            let policy = RetryPolicy::new(max_attempts, Duration::ZERO);
            let mut retry = 0;
            let mut processed = 0;
            while !policy.exhausted(retry) {
                processed += 1;
                retry = policy.next_retry(retry);
            }
            prop_assert_eq!(processed, max_attempts);
            prop_assert_eq!(retry, max_attempts);
        }
    }
}
