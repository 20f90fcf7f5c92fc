//! Bounded exponential backoff for stage reconnection.

use std::time::Duration;

use rand::Rng;

use voxrelay_core::config::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before the stage is reported degraded.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Cap on backoff, and the probe interval once degraded.
    pub max_delay: Duration,
    /// Randomizes each delay by up to ±(factor * delay).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.initial_delay_ms)),
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    ///
    /// `initial * 2^(attempt - 1)`, capped at `max_delay`, then jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.initial_delay.as_millis() as u64;
        let capped_ms = base_ms
            .saturating_mul(1u64 << (attempt - 1).min(16))
            .min(self.max_delay.as_millis() as u64);

        if self.jitter_factor <= 0.0 || capped_ms == 0 {
            return Duration::from_millis(capped_ms);
        }

        let range = (capped_ms as f64 * self.jitter_factor) as u64;
        let offset = rand::rng().random_range(0..=range * 2);
        Duration::from_millis(capped_ms.saturating_sub(range).saturating_add(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy::from_config(&RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 2000,
            jitter_factor: jitter,
        })
    }

    #[test]
    fn test_exponential_growth_without_jitter() {
        let p = policy(0.0);
        assert_eq!(p.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(p.delay_for_attempt(6), Duration::from_millis(2000));
        assert_eq!(p.delay_for_attempt(60), Duration::from_millis(2000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let p = policy(0.2);
        for _ in 0..200 {
            let d = p.delay_for_attempt(2).as_millis();
            assert!((160..=240).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn test_config_is_sanitized() {
        let p = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 0,
            initial_delay_ms: 500,
            max_delay_ms: 10,
            jitter_factor: 4.0,
        });
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.max_delay, Duration::from_millis(500));
        assert_eq!(p.jitter_factor, 1.0);
    }
}
