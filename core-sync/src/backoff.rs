//! Exponential backoff for manager pushes.

use core_runtime::config::ReconcileSettings;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 4,
        }
    }
}

impl BackoffPolicy {
    pub fn from_settings(settings: &ReconcileSettings) -> Self {
        Self {
            base_delay: settings.backoff_base(),
            max_delay: settings.backoff_max(),
            max_attempts: settings.max_attempts,
        }
    }

    /// Wait after the failed `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// The full delay sequence of one invocation that fails every attempt.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).map(move |attempt| self.delay_for(attempt))
    }
}
