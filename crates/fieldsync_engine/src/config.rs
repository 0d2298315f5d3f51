//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for the bus client.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Channels to subscribe to.
    pub channels: Vec<String>,
    /// Liveness window: if no frame (heartbeats included) arrives within
    /// this window the connection is treated as dead.
    pub idle_timeout: Duration,
    /// A connection surviving this long resets the reconnect backoff to the
    /// minimum.
    pub stable_threshold: Duration,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
}

impl BusConfig {
    /// Creates a configuration for the given channel set.
    pub fn new(channels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            idle_timeout: Duration::from_secs(45),
            stable_threshold: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
        }
    }

    /// Sets the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the stable-connection threshold.
    pub fn with_stable_threshold(mut self, threshold: Duration) -> Self {
        self.stable_threshold = threshold;
        self
    }

    /// Sets the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Exponential backoff with jitter, capped at a maximum interval.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub multiplier: f64,
    /// Whether to add up to 25% jitter.
    pub add_jitter: bool,
}

impl BackoffConfig {
    /// Creates a backoff configuration with the given initial delay.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Disables jitter (deterministic delays, mainly for tests).
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay before the given attempt (1-indexed; attempt 0
    /// means no failures yet and gets no delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_secs_f64()
            * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            let jitter = capped * 0.25 * rand::random::<f64>();
            Duration::from_secs_f64(capped + jitter)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

/// Configuration for the outbox.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Retry ceiling: after this many failed attempts an entry is marked
    /// failed and surfaced for manual resolution.
    pub max_attempts: u32,
}

impl OutboxConfig {
    /// Creates a configuration with the given retry ceiling.
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_config_builder() {
        let config = BusConfig::new(["contacts", "orders"])
            .with_idle_timeout(Duration::from_secs(10))
            .with_stable_threshold(Duration::from_secs(5));

        assert_eq!(config.channels, vec!["contacts", "orders"]);
        assert_eq!(config.idle_timeout, Duration::from_secs(10));
        assert_eq!(config.stable_threshold, Duration::from_secs(5));
    }

    #[test]
    fn backoff_grows_exponentially() {
        let backoff = BackoffConfig::new(Duration::from_millis(100))
            .with_multiplier(2.0)
            .without_jitter();

        assert_eq!(backoff.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn backoff_respects_cap() {
        let backoff = BackoffConfig::new(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_multiplier(10.0)
            .without_jitter();

        assert_eq!(backoff.delay_for_attempt(6), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = BackoffConfig::new(Duration::from_millis(100)).with_multiplier(2.0);

        for _ in 0..20 {
            let delay = backoff.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }
}
