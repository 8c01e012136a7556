use std::time::Duration;

use rand::Rng;

use crate::BackoffPolicy;

/// Stateful exponential backoff driven by a [`BackoffPolicy`].
///
/// The first call to [`ExponentialBackoff::next_backoff`] returns
/// `base_delay ± jitter`. Every following call multiplies the current
/// interval, up to `max_delay`. Returns `None` once `max_retries` attempts
/// were made (never, if `max_retries` is 0).
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    policy: BackoffPolicy,
    current: Duration,
    attempts: usize,
}

impl ExponentialBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            current: policy.base_delay(),
            policy,
            attempts: 0,
        }
    }

    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.policy.max_retries > 0 && self.attempts >= self.policy.max_retries {
            return None;
        }
        self.attempts += 1;

        let interval = self.current;
        let next = interval.mul_f64(self.policy.multiplier);
        self.current = next.min(self.policy.max_delay());

        Some(randomize(interval, self.policy.randomization_factor).min(self.policy.max_delay()))
    }

    /// Start again from the base delay.
    pub fn reset(&mut self) {
        self.current = self.policy.base_delay();
        self.attempts = 0;
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

fn randomize(
    interval: Duration,
    factor: f64,
) -> Duration {
    if factor <= 0.0 {
        return interval;
    }
    let delta = factor * interval.as_secs_f64();
    let min = interval.as_secs_f64() - delta;
    let max = interval.as_secs_f64() + delta;
    Duration::from_secs_f64(rand::thread_rng().gen_range(min..=max))
}
