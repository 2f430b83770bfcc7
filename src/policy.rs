//! Reconnect backoff.
//!
//! The delay before retry `n` (1-indexed) is `base_delay × growth_factor^(n−1)`.
//! Retrying stops after `max_attempts` consecutive failures; the counter is
//! reset as soon as a connection succeeds.

use std::time::Duration;

use crate::config::ReconnectSettings;

#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    attempt_count: u32,
    base_delay: Duration,
    growth_factor: f64,
    max_attempts: u32,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(settings: &ReconnectSettings) -> Self {
        Self {
            attempt_count: 0,
            base_delay: settings.base_delay,
            growth_factor: settings.growth_factor,
            max_attempts: settings.max_attempts,
        }
    }

    /// Number of consecutive failed attempts.
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry `attempt` (1-indexed).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.growth_factor.powi(exponent);

        // Saturate rather than panic on absurd settings.
        let secs = self.base_delay.as_secs_f64() * factor;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Records a failed attempt and returns the delay before the next one, or
    /// `None` when the attempt budget is exhausted.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.attempt_count = self.attempt_count.saturating_add(1);
        if self.attempt_count > self.max_attempts {
            return None;
        }

        Some(self.delay_for(self.attempt_count))
    }

    /// Records a successful connection.
    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }
}
