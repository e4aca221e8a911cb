//! Spacing of replay upload attempts.
//!
//! A worker that fails to deliver an envelope waits `initial * coefficient^n`
//! before attempt `n + 2`, so the first retry waits `initial`. The wait never
//! drops below a `Retry-After` sent by the upstream and never exceeds the
//! configured maximum, which also caps `Retry-After`.

use std::time;

#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    backoff_coefficient: u32,
    initial_interval: time::Duration,
    /// `None` lets the backoff grow until it saturates
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Wait before the next upload attempt. `retries_done` is 0 when the first
    /// attempt has just failed.
    pub fn time_until_next_retry(
        &self,
        retries_done: u32,
        retry_after: Option<time::Duration>,
    ) -> time::Duration {
        let backoff = self
            .initial_interval
            .checked_mul(self.backoff_coefficient.saturating_pow(retries_done))
            .unwrap_or(time::Duration::MAX);
        let wait = retry_after.map_or(backoff, |upstream| backoff.max(upstream));
        self.maximum_interval.map_or(wait, |max| wait.min(max))
    }
}

/// Doubles from one second, uncapped.
impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, time::Duration::from_secs(1), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_grow_up_to_the_maximum() {
        let policy = RetryPolicy::new(
            2,
            time::Duration::from_millis(100),
            Some(time::Duration::from_millis(500)),
        );

        assert_eq!(
            policy.time_until_next_retry(0, None),
            time::Duration::from_millis(100)
        );
        assert_eq!(
            policy.time_until_next_retry(2, None),
            time::Duration::from_millis(400)
        );
        assert_eq!(
            policy.time_until_next_retry(3, None),
            time::Duration::from_millis(500)
        );
        assert_eq!(
            policy.time_until_next_retry(40, None),
            time::Duration::from_millis(500)
        );
    }

    #[test]
    fn retry_after_is_honoured_within_the_maximum() {
        let policy = RetryPolicy::new(
            2,
            time::Duration::from_millis(100),
            Some(time::Duration::from_secs(10)),
        );

        assert_eq!(
            policy.time_until_next_retry(0, Some(time::Duration::from_secs(3))),
            time::Duration::from_secs(3)
        );
        assert_eq!(
            policy.time_until_next_retry(0, Some(time::Duration::from_secs(60))),
            time::Duration::from_secs(10)
        );
        assert_eq!(
            RetryPolicy::default().time_until_next_retry(1, Some(time::Duration::from_secs(30))),
            time::Duration::from_secs(30)
        );
    }

    #[test]
    fn uncapped_backoff_saturates() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.time_until_next_retry(0, None), time::Duration::from_secs(1));
        assert_eq!(policy.time_until_next_retry(200, None), time::Duration::MAX);
    }
}
