//! Exponential backoff with symmetric jitter.

use rand::Rng;
use std::time::Duration;

/// Backoff schedule configuration.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay, and the value `reset()` restores.
    pub initial_delay: Duration,
    /// Ceiling for both the pre-jitter schedule and the returned delay.
    pub max_delay: Duration,
    /// Growth factor applied after each `next()`.
    pub multiplier: f64,
    /// Symmetric jitter factor in [0, 1); each delay is scaled by
    /// `1 + U(-jitter, +jitter)`.
    pub jitter: f64,
    /// Maximum attempts before `should_continue()` turns false; 0 = unlimited.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(15 * 60),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: 0,
        }
    }
}

impl BackoffConfig {
    /// Profile for heartbeat-class endpoints that must survive multi-day
    /// outages: slower start, higher ceiling, wider jitter.
    pub fn network_outage() -> Self {
        Self {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(30 * 60),
            multiplier: 2.0,
            jitter: 0.3,
            max_attempts: 0,
        }
    }
}

/// Stateful exponential backoff.
///
/// One instance per retry-bearing caller; `reset()` after every success.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current_delay: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current_delay = config.initial_delay;
        Self {
            config,
            current_delay,
            attempt: 0,
        }
    }

    /// Return the next delay and advance the schedule.
    ///
    /// The returned value is the current pre-jitter delay scaled by the
    /// jitter factor, clamped to `[0, max_delay]`.
    pub fn next(&mut self) -> Duration {
        let base = self.current_delay;

        let jittered = if self.config.jitter > 0.0 {
            let jitter = rand::thread_rng().gen_range(-self.config.jitter..=self.config.jitter);
            let secs = base.as_secs_f64() * (1.0 + jitter);
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            base
        };

        self.attempt += 1;

        let grown = Duration::from_secs_f64(base.as_secs_f64() * self.config.multiplier);
        self.current_delay = grown.min(self.config.max_delay);

        jittered.min(self.config.max_delay)
    }

    /// Pre-jitter delay the next `next()` call will start from.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Attempts made since construction or the last `reset()`.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Whether the attempt cap (if any) has been reached.
    pub fn should_continue(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt < self.config.max_attempts
    }

    /// Restore the schedule to its initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.config.initial_delay;
    }
}
