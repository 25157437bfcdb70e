//! Reconnection Policy
//!
//! Delay schedule between upstream reconnection attempts. The relay default
//! is a fixed 3 second backoff; growth and jitter are available for
//! deployments that want to spread reconnect storms.
//!
//! The schedule is a pure function of the attempt number, so a policy only
//! tracks how many attempts have happened since the last good connection.

use std::time::Duration;

use rand::Rng;

/// Default delay between reconnection attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(3);

/// Shape of the backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound for any single delay, before jitter.
    pub ceiling: Duration,
    /// Growth per attempt (1.0 keeps the delay fixed).
    pub growth: f64,
    /// Fraction of the delay to randomize in either direction.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::fixed(DEFAULT_BACKOFF)
    }
}

impl ReconnectConfig {
    /// Same delay every time.
    #[must_use]
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            base: delay,
            ceiling: delay,
            growth: 1.0,
            jitter: 0.0,
        }
    }

    /// Geometric growth from `base` up to `ceiling`, randomized by `jitter`.
    #[must_use]
    pub const fn exponential(base: Duration, ceiling: Duration, growth: f64, jitter: f64) -> Self {
        Self {
            base,
            ceiling,
            growth,
            jitter,
        }
    }

    /// Un-jittered delay for the zero-based `attempt`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.growth <= 1.0 {
            return self.base.min(self.ceiling);
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.growth.powi(exponent);
        if !factor.is_finite() {
            return self.ceiling;
        }
        let millis = (self.base.as_millis() as f64 * factor).round();
        if millis >= self.ceiling.as_millis() as f64 {
            return self.ceiling;
        }
        Duration::from_millis(millis as u64)
    }
}

/// Attempt counter over a [`ReconnectConfig`]. Never gives up; only
/// cancellation stops a connector.
///
/// # Example
///
/// ```rust
/// use market_stream_relay::application::services::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::fixed(Duration::from_secs(3)));
///
/// assert_eq!(policy.next_delay(), Duration::from_secs(3));
/// assert_eq!(policy.next_delay(), Duration::from_secs(3));
///
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Fresh policy with no attempts recorded.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt.
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.delay_for(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        jittered(delay, self.config.jitter)
    }

    /// Start over after a successful connection.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempts
    }
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let scale = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
    delay
        .mul_f64(scale.max(0.0))
        .max(Duration::from_millis(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retries_every_three_seconds() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::default());

        for _ in 0..5 {
            assert_eq!(policy.next_delay(), DEFAULT_BACKOFF);
        }
        assert_eq!(policy.attempt_count(), 5);
    }

    #[test]
    fn fixed_schedule_ignores_attempt_number() {
        let config = ReconnectConfig::fixed(Duration::from_millis(250));

        assert_eq!(config.delay_for(0), Duration::from_millis(250));
        assert_eq!(config.delay_for(u32::MAX), Duration::from_millis(250));
    }

    #[test]
    fn growth_stops_at_ceiling() {
        let config = ReconnectConfig::exponential(
            Duration::from_millis(100),
            Duration::from_millis(500),
            2.0,
            0.0,
        );
        let delays: Vec<_> = (0..5).map(|n| config.delay_for(n).as_millis()).collect();

        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
        assert_eq!(config.delay_for(10_000), Duration::from_millis(500));
    }

    #[test]
    fn reset_starts_schedule_over() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::exponential(
            Duration::from_millis(50),
            Duration::from_secs(5),
            3.0,
            0.0,
        ));
        assert_eq!(policy.next_delay(), Duration::from_millis(50));
        assert_eq!(policy.next_delay(), Duration::from_millis(150));

        policy.reset();

        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Duration::from_millis(50));
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let config = ReconnectConfig::exponential(
            Duration::from_secs(1),
            Duration::from_secs(1),
            1.0,
            0.2,
        );

        for _ in 0..200 {
            let millis = ReconnectPolicy::new(config).next_delay().as_millis();
            assert!((800..=1200).contains(&millis), "{millis}ms out of range");
        }
    }
}
