use std::time::Duration;

use statusbot_config::ReconnectConfig;

/// Capped exponential reconnect backoff with an optional attempt limit.
///
/// The default retries immediately and without limit. Attempts that fail
/// before a session exists wait at least `failure_floor`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    failure_floor: Duration,
    max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::immediate()
    }
}

impl ReconnectPolicy {
    pub fn immediate() -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            multiplier: 1.0,
            failure_floor: Duration::ZERO,
            max_attempts: None,
        }
    }

    pub fn exponential(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: multiplier.max(1.0),
            failure_floor: Duration::ZERO,
            max_attempts: None,
        }
    }

    #[must_use]
    pub fn with_failure_floor(mut self, floor: Duration) -> Self {
        self.failure_floor = floor;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::exponential(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.multiplier,
        )
        .with_failure_floor(Duration::from_millis(config.failure_delay_ms))
        .with_max_attempts(config.max_attempts)
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (1 for the first retry).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.initial.is_zero() {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(63) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay before retry number `attempt` after a connect failure.
    pub fn failure_delay_for(&self, attempt: u32) -> Duration {
        self.delay_for(attempt).max(self.failure_floor)
    }

    /// Whether retry number `attempt` may still be made.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }
}
