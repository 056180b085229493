use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::operation::FailureReason;
use crate::transport::TransportFailure;

/// The operation kinds whose failures are fed through a [`RetryPolicy`]
///
/// These are the steps needed to reach a usable connection; failures of
/// any other operation go straight back to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RetryKind {
    Connect,
    DiscoverCapabilities,
    Bond,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GiveUpReason {
    /// The failure can't be helped by trying again (e.g. the user
    /// rejected pairing)
    NotRetryable(FailureReason),
    AttemptsExhausted { last: FailureReason },
    DeadlineExceeded { last: FailureReason },
}

impl GiveUpReason {
    pub fn last_failure(&self) -> &FailureReason {
        match self {
            GiveUpReason::NotRetryable(reason) => reason,
            GiveUpReason::AttemptsExhausted { last } => last,
            GiveUpReason::DeadlineExceeded { last } => last,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryVerdict {
    RetryNow,
    RetryAfter(Duration),
    GiveUp(GiveUpReason),
}

impl RetryVerdict {
    pub fn is_retry(&self) -> bool {
        !matches!(self, RetryVerdict::GiveUp(_))
    }

    pub fn delay(&self) -> Option<Duration> {
        match self {
            RetryVerdict::RetryAfter(delay) => Some(*delay),
            _ => None,
        }
    }
}

/// Consecutive-failure bookkeeping for one retry-eligible kind on one peer
#[derive(Clone, Debug)]
pub struct RetryContext {
    kind: RetryKind,
    failures: u32,
    last_failure: Option<FailureReason>,
    first_failure_at: Option<Instant>,
    elapsed: Duration,
    history: Vec<RetryVerdict>,
}

impl RetryContext {
    pub fn new(kind: RetryKind) -> Self {
        RetryContext {
            kind,
            failures: 0,
            last_failure: None,
            first_failure_at: None,
            elapsed: Duration::ZERO,
            history: vec![],
        }
    }

    pub fn kind(&self) -> RetryKind {
        self.kind
    }
    /// Consecutive failures since the last success (or reset)
    pub fn failures(&self) -> u32 {
        self.failures
    }
    pub fn last_failure(&self) -> Option<&FailureReason> {
        self.last_failure.as_ref()
    }
    /// Time since the first failure of the current run
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
    pub fn history(&self) -> &[RetryVerdict] {
        &self.history
    }

    pub(crate) fn record_failure(&mut self, reason: FailureReason, now: Instant) {
        let first = *self.first_failure_at.get_or_insert(now);
        self.failures += 1;
        self.elapsed = now.saturating_duration_since(first);
        self.last_failure = Some(reason);
    }

    pub(crate) fn record_verdict(&mut self, verdict: RetryVerdict) {
        self.history.push(verdict);
    }

    pub(crate) fn reset(&mut self) {
        *self = RetryContext::new(self.kind);
    }
}

/// Decides whether a failed connection step should be tried again
///
/// Implementations must be a pure function of the context so they can be
/// swapped and tested in isolation; all bookkeeping lives in the
/// `RetryContext`.
pub trait RetryPolicy: Send {
    fn decide(&self, ctx: &RetryContext) -> RetryVerdict;
}

impl<F> RetryPolicy for F
    where F: Fn(&RetryContext) -> RetryVerdict + Send
{
    fn decide(&self, ctx: &RetryContext) -> RetryVerdict {
        self(ctx)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first, before giving up
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    /// Give up once this long has passed since the first failure
    pub give_up_after: Option<Duration>,
    /// Reported failures that are never retried
    pub give_up_immediately_on: Vec<TransportFailure>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            backoff_multiplier: 1.0,
            max_backoff: Duration::from_secs(5),
            give_up_after: None,
            give_up_immediately_on: vec![TransportFailure::PairingRejected],
        }
    }
}

/// Bounded backoff up to `max_attempts`
#[derive(Clone, Debug, Default)]
pub struct DefaultRetryPolicy {
    config: RetryConfig,
}

impl DefaultRetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        DefaultRetryPolicy { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn is_retryable(&self, reason: &FailureReason) -> bool {
        match reason {
            FailureReason::Cancelled | FailureReason::AlreadyConnected => false,
            FailureReason::Reported(failure) => !self.config.give_up_immediately_on.contains(failure),
            _ => true,
        }
    }

    /// Delay before the attempt following failure number `failures`
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.config.initial_backoff.as_secs_f64() *
                   self.config.backoff_multiplier.powi(exponent);
        let max = self.config.max_backoff.as_secs_f64();
        if secs.is_finite() && secs >= 0.0 && secs < max {
            Duration::from_secs_f64(secs)
        } else {
            self.config.max_backoff
        }
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn decide(&self, ctx: &RetryContext) -> RetryVerdict {
        let last = match ctx.last_failure() {
            Some(last) => last.clone(),
            None => return RetryVerdict::RetryNow,
        };

        if !self.is_retryable(&last) {
            return RetryVerdict::GiveUp(GiveUpReason::NotRetryable(last));
        }
        if ctx.failures() >= self.config.max_attempts {
            return RetryVerdict::GiveUp(GiveUpReason::AttemptsExhausted { last });
        }
        if let Some(limit) = self.config.give_up_after {
            if ctx.elapsed() >= limit {
                return RetryVerdict::GiveUp(GiveUpReason::DeadlineExceeded { last });
            }
        }

        let delay = self.backoff(ctx.failures());
        if delay.is_zero() {
            RetryVerdict::RetryNow
        } else {
            RetryVerdict::RetryAfter(delay)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(times: u32, reason: FailureReason, start: Instant, step: Duration) -> RetryContext {
        let mut ctx = RetryContext::new(RetryKind::Connect);
        for i in 0..times {
            ctx.record_failure(reason.clone(), start + step * i);
        }
        ctx
    }

    #[test]
    fn three_attempts_then_give_up() {
        let policy = DefaultRetryPolicy::default();
        let now = Instant::now();
        let step = Duration::from_millis(300);

        for failures in 1..3 {
            let ctx = failed(failures, FailureReason::TimedOut, now, step);
            assert_eq!(policy.decide(&ctx), RetryVerdict::RetryAfter(Duration::from_millis(250)));
        }
        let ctx = failed(3, FailureReason::TimedOut, now, step);
        assert_eq!(policy.decide(&ctx),
                   RetryVerdict::GiveUp(GiveUpReason::AttemptsExhausted { last: FailureReason::TimedOut }));
    }

    #[test]
    fn pairing_rejection_bypasses_retry() {
        let policy = DefaultRetryPolicy::default();
        let reason = FailureReason::Reported(TransportFailure::PairingRejected);
        let ctx = failed(1, reason.clone(), Instant::now(), Duration::ZERO);
        assert_eq!(policy.decide(&ctx), RetryVerdict::GiveUp(GiveUpReason::NotRetryable(reason)));
    }

    #[test]
    fn cancelled_is_never_retried() {
        let policy = DefaultRetryPolicy::default();
        let ctx = failed(1, FailureReason::Cancelled, Instant::now(), Duration::ZERO);
        assert!(!policy.decide(&ctx).is_retry());
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = DefaultRetryPolicy::new(RetryConfig {
            max_attempts: 10,
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(1),
            ..RetryConfig::default()
        });
        assert_eq!(policy.backoff(1), Duration::from_millis(250));
        assert_eq!(policy.backoff(2), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_secs(1));
        assert_eq!(policy.backoff(9), Duration::from_secs(1));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn zero_backoff_retries_now() {
        let policy = DefaultRetryPolicy::new(RetryConfig {
            initial_backoff: Duration::ZERO,
            ..RetryConfig::default()
        });
        let ctx = failed(1, FailureReason::LinkLost, Instant::now(), Duration::ZERO);
        assert_eq!(policy.decide(&ctx), RetryVerdict::RetryNow);
    }

    #[test]
    fn deadline_bounds_total_time() {
        let policy = DefaultRetryPolicy::new(RetryConfig {
            max_attempts: 100,
            give_up_after: Some(Duration::from_secs(2)),
            ..RetryConfig::default()
        });
        let ctx = failed(3, FailureReason::TimedOut, Instant::now(), Duration::from_secs(1));
        assert_eq!(ctx.elapsed(), Duration::from_secs(2));
        assert_eq!(policy.decide(&ctx),
                   RetryVerdict::GiveUp(GiveUpReason::DeadlineExceeded { last: FailureReason::TimedOut }));
    }

    #[test]
    fn closures_are_policies() {
        let never = |_: &RetryContext| RetryVerdict::GiveUp(GiveUpReason::NotRetryable(FailureReason::LinkLost));
        let ctx = failed(1, FailureReason::LinkLost, Instant::now(), Duration::ZERO);
        assert!(!never.decide(&ctx).is_retry());
    }

    #[test]
    fn reset_forgets_failures() {
        let mut ctx = failed(2, FailureReason::TimedOut, Instant::now(), Duration::from_millis(10));
        ctx.record_verdict(RetryVerdict::RetryNow);
        ctx.reset();
        assert_eq!(ctx.failures(), 0);
        assert!(ctx.last_failure().is_none());
        assert!(ctx.history().is_empty());
        assert_eq!(ctx.kind(), RetryKind::Connect);
    }
}
