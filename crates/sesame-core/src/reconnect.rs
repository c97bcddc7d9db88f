//! Backoff policy for connect failures.
//!
//! When a connect attempt fails the session waits for
//! [`ReconnectOptions::delay_for_attempt`] before falling back to scanning.
//! There is no attempt cap: a session keeps scanning until it is closed.

use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};

/// Options for the delay between a failed connect and the next scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectOptions {
    /// Delay after the first consecutive failure.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (for exponential backoff).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to use exponential backoff.
    pub use_exponential_backoff: bool,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_exponential_backoff: true,
            jitter: false,
        }
    }
}

impl ReconnectOptions {
    /// Create new reconnect options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create options with a fixed delay (no backoff).
    pub fn fixed_delay(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            use_exponential_backoff: false,
            ..Default::default()
        }
    }

    /// Set the delay after the first failure.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay between attempts.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier for exponential backoff.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable exponential backoff.
    #[must_use]
    pub fn exponential_backoff(mut self, enabled: bool) -> Self {
        self.use_exponential_backoff = enabled;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Calculate the delay after `attempt` earlier consecutive failures.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = if self.use_exponential_backoff {
            let exp = attempt.min(i32::MAX as u32) as i32;
            let delay_ms = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exp);
            Duration::from_millis(delay_ms.min(self.max_delay.as_millis() as f64) as u64)
        } else {
            self.initial_delay
        };

        let delay = if self.jitter {
            base.mul_f64(1.0 + rand::rng().random::<f64>() * 0.25)
        } else {
            base
        };

        delay.min(self.max_delay.max(self.initial_delay))
    }

    /// Validate the options and return an error if invalid.
    ///
    /// Checks that:
    /// - `backoff_multiplier` is >= 1.0
    /// - `initial_delay` is > 0
    /// - `max_delay` >= `initial_delay`
    pub fn validate(&self) -> Result<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(Error::InvalidConfig(
                "backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.initial_delay.is_zero() {
            return Err(Error::InvalidConfig(
                "initial_delay must be > 0".to_string(),
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::InvalidConfig(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }
        Ok(())
    }
}
