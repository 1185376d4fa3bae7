//! Retry delay policy

use crate::config::{BackoffShape, ResilienceConfig};
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub shape: BackoffShape,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            shape: config.backoff,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            jitter: config.use_jitter,
        }
    }

    /// Delay before retry number `retry` (1 for the first retry)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let raw = match self.shape {
            BackoffShape::Constant => self.base_delay,
            BackoffShape::Linear => self.base_delay.saturating_mul(retry),
            BackoffShape::Exponential => {
                let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        let capped = raw.min(self.max_delay);
        if !self.jitter || capped.is_zero() {
            return capped;
        }

        // Equal jitter: keep half, randomize the other half
        let half = capped / 2;
        let spread = rand::thread_rng().gen_range(0.0..=1.0);
        half + half.mul_f64(spread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(shape: BackoffShape, jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            shape,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter,
        }
    }

    #[test]
    fn test_shapes() {
        let constant = policy(BackoffShape::Constant, false);
        let linear = policy(BackoffShape::Linear, false);
        let exponential = policy(BackoffShape::Exponential, false);

        assert_eq!(constant.delay_for(3), Duration::from_millis(100));
        assert_eq!(linear.delay_for(2), Duration::from_millis(200));
        assert_eq!(exponential.delay_for(1), Duration::from_millis(100));
        assert_eq!(exponential.delay_for(2), Duration::from_millis(200));
    }

    #[test]
    fn test_delay_is_capped() {
        let linear = policy(BackoffShape::Linear, false);
        let exponential = policy(BackoffShape::Exponential, false);
        assert_eq!(linear.delay_for(10), Duration::from_millis(350));
        assert_eq!(exponential.delay_for(64), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let exponential = policy(BackoffShape::Exponential, true);
        for retry in 1..8 {
            let delay = exponential.delay_for(retry);
            assert!(delay <= Duration::from_millis(350));
        }
        let first = exponential.delay_for(1);
        assert!(first >= Duration::from_millis(50));
    }
}
