//! Exponential backoff with jitter for requeueing failed reconciles.
//!
//! Jitter spreads retries from several failure sources so that a recovering
//! API server is not hit by synchronized bursts.

use std::time::Duration;

use rand::Rng;

/// Configuration for requeue delays after transient failures.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

/// Stateful backoff sequence derived from a [`RetryConfig`]
#[derive(Clone, Debug)]
pub struct Backoff {
    config: RetryConfig,
    next: Duration,
    attempt: u32,
}

impl Backoff {
    /// Start a new backoff sequence
    pub fn new(config: RetryConfig) -> Self {
        Self {
            next: config.initial_delay,
            config,
            attempt: 0,
        }
    }

    /// Delay before the next retry, with 0.5x to 1.5x jitter
    ///
    /// The jittered value never exceeds `max_delay`.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let base = self.next;

        let grown = Duration::from_secs_f64(base.as_secs_f64() * self.config.backoff_multiplier);
        self.next = grown.min(self.config.max_delay);

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(base.as_secs_f64() * jitter).min(self.config.max_delay)
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Restart from the initial delay after a success
    pub fn reset(&mut self) {
        self.next = self.config.initial_delay;
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn delays_grow_within_jitter_bounds() {
        let mut backoff = Backoff::new(config());
        let expected_bases = [1.0, 2.0, 4.0, 8.0];
        for base in expected_bases {
            let delay = backoff.next_delay().as_secs_f64();
            assert!(delay >= base * 0.5 && delay <= base * 1.5, "{delay} vs {base}");
        }
        assert_eq!(backoff.attempt(), 4);
    }

    #[test]
    fn delays_are_capped() {
        let mut backoff = Backoff::new(config());
        for _ in 0..20 {
            assert!(backoff.next_delay() <= Duration::from_secs(10));
        }
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut backoff = Backoff::new(config());
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay() <= Duration::from_millis(1500));
    }
}
