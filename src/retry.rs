//! Reconnect retry policies.
//!
//! A [`RetryPolicy`] answers a single question for a failed bridge: given how
//! many attempts have been made since the first failure and how long ago that
//! failure was, should another connect be attempted now? Policies are
//! stateless; the bridge supervisor tracks progress in a [`RetryState`].

use std::{
    fmt,
    time::{Duration, Instant},
};

/// Decides when a failed bridge may try to reconnect.
pub trait RetryPolicy: fmt::Debug + Send + Sync {
    /// Return `true` when a reconnect should be attempted.
    ///
    /// `attempts` counts reconnect attempts since the first failure and
    /// `elapsed_ms` is the time since that failure. Attempt zero never
    /// retries.
    fn should_retry(&self, attempts: u64, elapsed_ms: u64) -> bool;
}

/// Retry once `attempts * base` has elapsed.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use respmux::retry::{LinearRetry, RetryPolicy};
///
/// let policy = LinearRetry::new(Duration::from_millis(5000));
/// assert!(!policy.should_retry(2, 4999));
/// assert!(policy.should_retry(1, 5000));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinearRetry {
    base_ms: u64,
}

impl LinearRetry {
    /// Create a policy waiting `base` per attempt.
    #[must_use]
    pub fn new(base: Duration) -> Self {
        Self {
            base_ms: duration_ms(base),
        }
    }
}

impl RetryPolicy for LinearRetry {
    fn should_retry(&self, attempts: u64, elapsed_ms: u64) -> bool {
        attempts > 0 && elapsed_ms >= attempts.saturating_mul(self.base_ms)
    }
}

/// Retry once `min(base * 2^(attempts - 1), max)` has elapsed.
///
/// The delay saturates at `max` for attempt counts large enough to overflow.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use respmux::retry::{ExponentialRetry, RetryPolicy};
///
/// let policy = ExponentialRetry::new(Duration::from_millis(5000));
/// assert!(!policy.should_retry(0, u64::MAX));
/// assert!(policy.should_retry(1, 5600));
/// assert!(policy.should_retry(u64::MAX, 30_000));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExponentialRetry {
    base_ms: u64,
    max_ms: u64,
}

impl ExponentialRetry {
    /// Default ceiling on the delay between attempts.
    pub const DEFAULT_MAX: Duration = Duration::from_secs(10);

    /// Create a policy starting at `base` with the default ceiling.
    #[must_use]
    pub fn new(base: Duration) -> Self { Self::with_max(base, Self::DEFAULT_MAX) }

    /// Create a policy starting at `base` and never waiting longer than `max`.
    ///
    /// A `max` below `base` is raised to `base`.
    #[must_use]
    pub fn with_max(base: Duration, max: Duration) -> Self {
        let base_ms = duration_ms(base);
        Self {
            base_ms,
            max_ms: duration_ms(max).max(base_ms),
        }
    }

    /// Delay required before attempt number `attempts`.
    fn delay_ms(&self, attempts: u64) -> u64 {
        let shift = attempts.saturating_sub(1);
        u32::try_from(shift)
            .ok()
            .and_then(|shift| 1u64.checked_shl(shift))
            .and_then(|factor| self.base_ms.checked_mul(factor))
            .map_or(self.max_ms, |delay| delay.min(self.max_ms))
    }
}

impl RetryPolicy for ExponentialRetry {
    fn should_retry(&self, attempts: u64, elapsed_ms: u64) -> bool {
        attempts > 0 && elapsed_ms >= self.delay_ms(attempts)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Progress of a bridge through an outage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryState {
    first_failure: Option<Instant>,
    attempts: u64,
}

impl RetryState {
    /// Record a failure, remembering the first one of the outage.
    pub fn record_failure(&mut self, now: Instant) { self.first_failure.get_or_insert(now); }

    /// Count a reconnect attempt.
    pub fn record_attempt(&mut self) { self.attempts = self.attempts.saturating_add(1); }

    /// Clear the outage after a successful connect.
    pub fn reset(&mut self) { *self = Self::default(); }

    /// Number of reconnect attempts made during this outage.
    #[must_use]
    pub fn attempts(&self) -> u64 { self.attempts }

    /// Milliseconds since the first failure, or zero when healthy.
    #[must_use]
    pub fn elapsed_ms(&self, now: Instant) -> u64 {
        self.first_failure
            .map_or(0, |first| duration_ms(now.saturating_duration_since(first)))
    }

    /// Ask `policy` whether the next attempt may start now.
    ///
    /// The attempt about to be made is counted, so the first reconnect after
    /// a failure is evaluated as attempt one.
    #[must_use]
    pub fn permits(&self, policy: &dyn RetryPolicy, now: Instant) -> bool {
        policy.should_retry(self.attempts.saturating_add(1), self.elapsed_ms(now))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn exponential(base: u64) -> ExponentialRetry {
        ExponentialRetry::new(Duration::from_millis(base))
    }

    #[rstest]
    #[case(0, u64::MAX, false)]
    #[case(1, 4999, false)]
    #[case(1, 5600, true)]
    #[case(2, 9999, false)]
    #[case(2, 10_000, true)]
    #[case(40, 9999, false)]
    #[case(40, 10_000, true)]
    #[case(u64::MAX, 30_000, true)]
    fn exponential_boundaries(#[case] attempts: u64, #[case] elapsed: u64, #[case] expected: bool) {
        assert_eq!(exponential(5000).should_retry(attempts, elapsed), expected);
    }

    #[rstest]
    #[case(2, 4050, false)]
    #[case(2, 6050, true)]
    fn exponential_respects_custom_ceiling(
        #[case] attempts: u64,
        #[case] elapsed: u64,
        #[case] expected: bool,
    ) {
        let policy =
            ExponentialRetry::with_max(Duration::from_millis(5000), Duration::from_millis(6050));
        assert_eq!(policy.should_retry(attempts, elapsed), expected);
    }

    #[test]
    fn ceiling_below_base_is_raised() {
        let policy =
            ExponentialRetry::with_max(Duration::from_millis(200), Duration::from_millis(1));
        assert!(!policy.should_retry(1, 199));
        assert!(policy.should_retry(5, 200));
    }

    #[rstest]
    #[case(0, u64::MAX, false)]
    #[case(1, 4999, false)]
    #[case(1, 5000, true)]
    #[case(2, 4999, false)]
    #[case(2, 10_000, true)]
    #[case(u64::MAX, u64::MAX, true)]
    #[case(u64::MAX, 5000, false)]
    fn linear_boundaries(#[case] attempts: u64, #[case] elapsed: u64, #[case] expected: bool) {
        let policy = LinearRetry::new(Duration::from_millis(5000));
        assert_eq!(policy.should_retry(attempts, elapsed), expected);
    }

    #[test]
    fn state_tracks_outage() {
        let start = Instant::now();
        let mut state = RetryState::default();
        assert_eq!(state.elapsed_ms(start), 0);

        state.record_failure(start);
        state.record_failure(start + Duration::from_secs(3));
        assert_eq!(state.elapsed_ms(start + Duration::from_millis(1500)), 1500);

        let policy = LinearRetry::new(Duration::from_millis(1000));
        assert!(!state.permits(&policy, start + Duration::from_millis(999)));
        assert!(state.permits(&policy, start + Duration::from_millis(1000)));

        state.record_attempt();
        assert_eq!(state.attempts(), 1);
        assert!(!state.permits(&policy, start + Duration::from_millis(1999)));

        state.reset();
        assert_eq!(state, RetryState::default());
    }
}
