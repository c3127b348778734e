//! Retry classification and jittered exponential backoff (§4.7, §8
//! scenario 7). Grounded in this codebase's existing backoff-with-jitter
//! pattern for connection reconnects; reused here for write retries.

use std::time::Duration;

use rand::Rng;

use crate::error::message_is_retryable;

pub struct RetryManager {
    max_retries: u32,
    retry_interval: Duration,
    retry_backoff: f64,
    max_retry_delay: Duration,
}

impl RetryManager {
    pub fn new(
        max_retries: u32,
        retry_interval: Duration,
        retry_backoff: f64,
        max_retry_delay: Duration,
    ) -> Self {
        Self {
            max_retries,
            retry_interval,
            retry_backoff,
            max_retry_delay,
        }
    }

    /// `shouldRetry(item, err)`: true iff `retryCount < maxRetries` and the
    /// error message matches one of the known transient substrings.
    pub fn should_retry(&self, retry_count: u32, error_message: &str) -> bool {
        retry_count < self.max_retries && message_is_retryable(error_message)
    }

    /// `retryInterval · retryBackoff^retryCount`, capped at
    /// `maxRetryDelay`, with +/-10% jitter.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.delay_for_with_jitter(retry_count, jitter_sample())
    }

    /// `jitter` in `[-0.1, 0.1]`; split out so tests can assert the exact
    /// bound without depending on the RNG.
    fn delay_for_with_jitter(&self, retry_count: u32, jitter: f64) -> Duration {
        let base_secs = self.retry_interval.as_secs_f64() * self.retry_backoff.powi(retry_count as i32);
        let capped_secs = base_secs.min(self.max_retry_delay.as_secs_f64());
        let jittered = (capped_secs * (1.0 + jitter)).max(0.0);
        Duration::from_secs_f64(jittered)
    }
}

fn jitter_sample() -> f64 {
    rand::thread_rng().gen_range(-0.1..=0.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_exhausted_after_max() {
        let rm = RetryManager::new(3, Duration::from_secs(1), 2.0, Duration::from_secs(30));
        assert!(rm.should_retry(2, "connection reset"));
        assert!(!rm.should_retry(3, "connection reset"));
    }

    #[test]
    fn non_retryable_message_is_rejected_immediately() {
        let rm = RetryManager::new(3, Duration::from_secs(1), 2.0, Duration::from_secs(30));
        assert!(!rm.should_retry(0, "invalid signature"));
    }

    #[test]
    fn backoff_sequence_matches_scenario_seven() {
        let rm = RetryManager::new(6, Duration::from_secs(1), 2.0, Duration::from_secs(30));
        let expected = [1.0, 2.0, 4.0, 8.0, 16.0, 30.0];
        for (attempt, expected_secs) in expected.iter().enumerate() {
            let d = rm.delay_for_with_jitter(attempt as u32, 0.0);
            assert!((d.as_secs_f64() - expected_secs).abs() < 1e-9);
        }
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let rm = RetryManager::new(6, Duration::from_secs(1), 2.0, Duration::from_secs(30));
        for attempt in 0..6 {
            let lo = rm.delay_for_with_jitter(attempt, -0.1).as_secs_f64();
            let hi = rm.delay_for_with_jitter(attempt, 0.1).as_secs_f64();
            let base = rm.delay_for_with_jitter(attempt, 0.0).as_secs_f64();
            assert!(lo <= base && base <= hi);
        }
    }
}
