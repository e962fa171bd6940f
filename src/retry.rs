//! Bounded exponential backoff for re-establishing live subscriptions.

use rand::Rng;
use std::time::Duration;

/// Backoff policy for resubscribe attempts.
///
/// After a live subscription drops, the first resubscribe attempt is made
/// immediately. Each failed attempt waits `next_backoff` before the next one,
/// and after `max_retries` failed retries the consumer stops with
/// [`StreamError::ResubscribeExhausted`](crate::StreamError::ResubscribeExhausted).
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub max_retries: u32,
    pub jitter: JitterMode,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: 10,
            jitter: JitterMode::Full,
        }
    }
}

impl RetryConfig {
    /// Create a policy with the default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay before the first retry.
    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    /// Set the cap on any single delay.
    pub fn with_max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    /// Set the growth factor between consecutive delays.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set how many retries are allowed before giving up.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the jitter mode.
    pub fn with_jitter(mut self, jitter: JitterMode) -> Self {
        self.jitter = jitter;
        self
    }

    /// Undithered delay before retry number `attempt` (zero-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }

    /// Delay before retry number `attempt`, with jitter applied.
    pub fn next_backoff(&self, attempt: u32) -> Duration {
        apply_jitter(self.base_delay(attempt), &self.jitter)
    }

    /// Whether another retry is allowed after `attempt` retries have failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Jitter applied to each backoff delay.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum JitterMode {
    /// Exact delay.
    None,
    /// Uniform between zero and the delay.
    #[default]
    Full,
    /// Half fixed, half random.
    Equal,
}

/// Apply `mode` to `delay`.
pub fn apply_jitter(delay: Duration, mode: &JitterMode) -> Duration {
    let mut rng = rand::thread_rng();

    match mode {
        JitterMode::None => delay,
        JitterMode::Full => delay.mul_f64(rng.gen::<f64>()),
        JitterMode::Equal => {
            let half = delay / 2;
            half + half.mul_f64(rng.gen::<f64>())
        }
    }
}
