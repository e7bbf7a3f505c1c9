use std::time::Duration;

use serde::Deserialize;

/// Backoff policy configuration. Cloned into each retry loop, so one
/// policy value can hand out independent strategies to every channel.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry. Default: 500ms.
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Multiplicative growth factor per attempt. Default: 2.0.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Delay ceiling. Default: 30s.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Attempts after which the strategy gives up. Default: 8.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_max_attempts() -> u32 {
    8
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            multiplier: default_multiplier(),
            max_delay: default_max_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetryPolicy {
    /// Builds a fresh strategy for a single retry loop.
    pub fn strategy(&self) -> ExponentialBackoff {
        ExponentialBackoff { policy: *self }
    }
}

/// Fixed exponential backoff: initial delay grown multiplicatively up to a
/// ceiling, giving up after a maximum attempt count.
///
/// Not shared between loops; each caller builds its own via
/// [`RetryPolicy::strategy`].
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    policy: RetryPolicy,
}

impl ExponentialBackoff {
    /// Returns the delay before retry number `attempt` (1-based), or `None`
    /// once the attempt budget is exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.policy.max_attempts {
            return None;
        }

        let factor = self.policy.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.policy.initial_delay.as_secs_f64() * factor;

        Some(Duration::from_secs_f64(
            delay.min(self.policy.max_delay.as_secs_f64()),
        ))
    }
}
