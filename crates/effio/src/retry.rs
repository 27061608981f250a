// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Retry on failure, repeat on success.

use std::sync::Arc;
use std::time::Duration;

use effio_rt::Error;
use tracing::debug;

use crate::effect::Effect;

type RetryIf = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// How often and how patiently to retry a failing effect.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Re-evaluations after the first attempt.
    pub max_retries: u32,
    /// Pause before the first retry.
    pub delay: Duration,
    /// Growth factor applied to the pause after each retry. 1.0 keeps it
    /// fixed.
    pub multiplier: f64,
    /// Upper bound for the pause.
    pub max_delay: Option<Duration>,
    retry_if: Option<RetryIf>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("delay", &self.delay)
            .field("multiplier", &self.multiplier)
            .field("max_delay", &self.max_delay)
            .field("filtered", &self.retry_if.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// `max_retries` retries, `delay` apart.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            multiplier: 1.0,
            max_delay: None,
            retry_if: None,
        }
    }

    pub fn with_backoff(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Only retry failures `predicate` accepts. `Cancelled` is never
    /// retried regardless.
    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    fn should_retry(&self, error: &Error) -> bool {
        !error.is_cancelled() && self.retry_if.as_ref().map_or(true, |p| p(error))
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        // Saturate instead of panicking once the backoff leaves `Duration`.
        let next = Duration::try_from_secs_f64(delay.as_secs_f64() * self.multiplier)
            .unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(max) => next.min(max),
            None => next,
        }
    }
}

/// How often to repeat a succeeding effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepeatPolicy {
    /// Re-evaluations after the first run.
    pub repetitions: u32,
    /// Pause between runs.
    pub interval: Duration,
}

impl RepeatPolicy {
    pub fn new(repetitions: u32, interval: Duration) -> Self {
        Self {
            repetitions,
            interval,
        }
    }
}

pub(crate) fn retry<T: Send + 'static>(effect: &Effect<T>, policy: RetryPolicy) -> Effect<T> {
    let delay = policy.max_delay.map_or(policy.delay, |max| policy.delay.min(max));
    attempt(effect.clone(), Arc::new(policy), 0, delay)
}

fn attempt<T: Send + 'static>(
    effect: Effect<T>,
    policy: Arc<RetryPolicy>,
    retries: u32,
    delay: Duration,
) -> Effect<T> {
    let source = effect.clone();
    source.handle_error_with(move |error| {
        if retries >= policy.max_retries || !policy.should_retry(&error) {
            return Effect::raise(error);
        }
        debug!(retry = retries + 1, ?delay, error = %error, "retrying failed effect");
        let effect = effect.clone();
        let policy = policy.clone();
        let next = policy.next_delay(delay);
        Effect::sleep(delay).flat_map(move |()| attempt(effect.clone(), policy.clone(), retries + 1, next))
    })
}

pub(crate) fn repeat<T>(effect: &Effect<T>, policy: RepeatPolicy) -> Effect<T>
where
    T: Clone + Send + Sync + 'static,
{
    run_again(effect.clone(), policy.interval, policy.repetitions)
}

fn run_again<T>(effect: Effect<T>, interval: Duration, remaining: u32) -> Effect<T>
where
    T: Clone + Send + Sync + 'static,
{
    let source = effect.clone();
    source.flat_map(move |value| {
        if remaining == 0 {
            return Effect::pure(value);
        }
        let effect = effect.clone();
        let next = run_again(effect, interval, remaining - 1);
        if interval.is_zero() {
            next
        } else {
            Effect::sleep(interval).and_then(&next)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(100))
            .with_backoff(2.0)
            .with_max_delay(Duration::from_millis(300));
        let d1 = policy.next_delay(policy.delay);
        let d2 = policy.next_delay(d1);
        assert_eq!(d1, Duration::from_millis(200));
        assert_eq!(d2, Duration::from_millis(300));
    }

    #[test]
    fn steep_backoff_saturates() {
        let policy = RetryPolicy::fixed(40, Duration::from_millis(100)).with_backoff(10.0);
        let mut delay = policy.delay;
        for _ in 0..40 {
            delay = policy.next_delay(delay);
        }
        assert_eq!(delay, Duration::MAX);

        let capped = policy.with_max_delay(Duration::from_secs(60));
        let mut delay = capped.delay;
        for _ in 0..40 {
            delay = capped.next_delay(delay);
        }
        assert_eq!(delay, Duration::from_secs(60));
    }

    #[test]
    fn fixed_policy_keeps_delay() {
        let policy = RetryPolicy::fixed(1, Duration::from_millis(50));
        assert_eq!(policy.next_delay(policy.delay), Duration::from_millis(50));
    }

    #[test]
    fn cancellation_is_never_retried() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO).retry_if(|_| true);
        assert!(!policy.should_retry(&Error::Cancelled));
        assert!(policy.should_retry(&Error::msg("flaky")));

        let picky = RetryPolicy::fixed(3, Duration::ZERO).retry_if(Error::is_timeout);
        assert!(!picky.should_retry(&Error::msg("flaky")));
    }
}
