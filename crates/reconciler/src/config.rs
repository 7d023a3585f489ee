use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Ceiling on the delete deadline; larger settings are clamped to it.
pub const MAX_DELETE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

/// Bounded exponential backoff for transient remote failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. 0 is treated as 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self { max_attempts: 1, ..Default::default() }
    }

    pub fn with_max_attempts(attempts: u32) -> Self {
        Self { max_attempts: attempts, ..Default::default() }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before retry number `attempt` (1-based: the wait after the first failure is `backoff_for(1)`).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }
}

/// Knobs for one reconciler instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    pub retry: RetryPolicy,
    /// Upper bound on every individual remote call.
    pub call_timeout: Duration,
    pub delete_poll_interval: Duration,
    /// Overall deadline for a delete to be confirmed by a not-found read.
    pub delete_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(30),
            delete_poll_interval: Duration::from_secs(1),
            delete_timeout: Duration::from_secs(300),
        }
    }
}

impl ReconcilerConfig {
    /// Defaults overridden by `JOBSYNC_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            retry: RetryPolicy {
                max_attempts: env_or("JOBSYNC_MAX_ATTEMPTS", d.retry.max_attempts),
                initial_backoff: Duration::from_millis(env_or("JOBSYNC_INITIAL_BACKOFF_MS", d.retry.initial_backoff.as_millis() as u64)),
                max_backoff: Duration::from_millis(env_or("JOBSYNC_MAX_BACKOFF_MS", d.retry.max_backoff.as_millis() as u64)),
                multiplier: env_or("JOBSYNC_BACKOFF_MULTIPLIER", d.retry.multiplier),
            },
            call_timeout: Duration::from_secs(env_or("JOBSYNC_CALL_TIMEOUT_SECS", d.call_timeout.as_secs())),
            delete_poll_interval: Duration::from_millis(env_or("JOBSYNC_DELETE_POLL_MS", d.delete_poll_interval.as_millis() as u64)),
            delete_timeout: Duration::from_secs(env_or("JOBSYNC_DELETE_TIMEOUT_SECS", d.delete_timeout.as_secs())).min(MAX_DELETE_TIMEOUT),
        }
    }
}
