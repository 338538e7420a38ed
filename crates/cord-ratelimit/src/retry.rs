//! Retry policy for REST attempts.
//!
//! - 429: wait exactly the server delay, no attempt cap, bounded by total
//!   time spent rate limited.
//! - 5xx, transport failure, timeout: exponential backoff, capped attempts.
//! - Other 4xx: surface immediately.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with optional proportional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    /// Initial backoff duration.
    pub initial: Duration,

    /// Maximum backoff duration.
    pub max: Duration,

    /// Multiplier for each attempt.
    pub multiplier: f64,

    /// Jitter as a fraction of the delay (0.0 disables it).
    pub jitter: f64,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff without jitter.
    #[must_use]
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    /// Set the jitter fraction, clamped to `0.0..=1.0`.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (0-based): `initial × 2^attempt`,
    /// jittered, never above `max`.
    #[must_use]
    pub fn next_backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max.as_secs_f64();
        let capped = base.min(max);

        let delay = if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
            (capped * factor).min(max)
        } else {
            capped
        };

        Duration::try_from_secs_f64(delay).unwrap_or(self.max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// What a single attempt produced, as far as retrying is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    /// 2xx/3xx.
    Success,
    /// 429 with the delay the server asked for.
    RateLimited { retry_after: Duration, global: bool },
    /// Any other non-success status.
    Status(u16),
    /// No response: connection error.
    TransportFailure,
    /// No response before the attempt deadline.
    TimedOut,
}

impl AttemptResult {
    /// Classify a response status.
    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        if status < 400 {
            Self::Success
        } else {
            Self::Status(status)
        }
    }
}

/// Broad class of a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    RateLimited,
    TransientServer,
    ClientRejected,
}

/// Where a retry delay is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryScope {
    /// The request's own bucket is throttled.
    Bucket,
    /// Every non-exempt bucket is paused.
    Global,
    /// Plain backoff sleep by the retrying request.
    Backoff,
}

/// Decision for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Accept,
    Retry { delay: Duration, scope: RetryScope },
    GiveUp(FailureClass),
}

/// Per-request retry bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Attempts dispatched so far.
    pub attempts: u32,
    /// Transient failures so far.
    pub transient_failures: u32,
    /// Total delay imposed by 429s so far.
    pub rate_limited_for: Duration,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum attempts when every failure is transient.
    pub max_attempts: u32,

    /// Backoff between transient failures.
    pub backoff: ExponentialBackoff,

    /// Upper bound on total 429 delay for one request.
    pub max_rate_limit_wait: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, backoff: ExponentialBackoff) -> Self {
        Self {
            max_attempts,
            backoff,
            max_rate_limit_wait: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub const fn with_max_rate_limit_wait(mut self, wait: Duration) -> Self {
        self.max_rate_limit_wait = wait;
        self
    }

    /// Decide what to do after an attempt, updating `state`.
    ///
    /// `state.attempts` must already count the attempt being judged.
    pub fn decide(&self, result: &AttemptResult, state: &mut RetryState) -> RetryDecision {
        match result {
            AttemptResult::Success => RetryDecision::Accept,
            AttemptResult::RateLimited {
                retry_after,
                global,
            } => {
                let total = state.rate_limited_for.saturating_add(*retry_after);
                if total > self.max_rate_limit_wait {
                    return RetryDecision::GiveUp(FailureClass::RateLimited);
                }
                state.rate_limited_for = total;
                RetryDecision::Retry {
                    delay: *retry_after,
                    scope: if *global {
                        RetryScope::Global
                    } else {
                        RetryScope::Bucket
                    },
                }
            }
            AttemptResult::Status(status) if *status < 500 => {
                RetryDecision::GiveUp(FailureClass::ClientRejected)
            }
            AttemptResult::Status(_)
            | AttemptResult::TransportFailure
            | AttemptResult::TimedOut => {
                let backoff_index = state.transient_failures;
                state.transient_failures += 1;
                if state.transient_failures >= self.max_attempts {
                    RetryDecision::GiveUp(FailureClass::TransientServer)
                } else {
                    RetryDecision::Retry {
                        delay: self.backoff.next_backoff(backoff_index),
                        scope: RetryScope::Backoff,
                    }
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, ExponentialBackoff::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            3,
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1)),
        )
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));

        assert_eq!(backoff.next_backoff(0), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(1), Duration::from_secs(2));
        assert_eq!(backoff.next_backoff(2), Duration::from_secs(4));
        assert_eq!(backoff.next_backoff(3), Duration::from_secs(8));
        assert_eq!(backoff.next_backoff(10), Duration::from_secs(60)); // Capped
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60))
            .with_jitter(0.1);
        for _ in 0..100 {
            let d = backoff.next_backoff(2);
            assert!(d >= Duration::from_millis(3599) && d <= Duration::from_millis(4401), "{d:?}");
        }
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(5))
            .with_jitter(0.5);
        for _ in 0..100 {
            let d = backoff.next_backoff(10);
            assert!(d >= Duration::from_millis(2499) && d <= Duration::from_secs(5), "{d:?}");
        }
    }

    #[test]
    fn test_success_is_accepted() {
        let mut state = RetryState::default();
        assert_eq!(
            policy().decide(&AttemptResult::from_status(204), &mut state),
            RetryDecision::Accept
        );
    }

    #[test]
    fn test_client_errors_are_not_retried() {
        for status in [400, 401, 403, 404, 405] {
            let mut state = RetryState {
                attempts: 1,
                ..RetryState::default()
            };
            assert_eq!(
                policy().decide(&AttemptResult::from_status(status), &mut state),
                RetryDecision::GiveUp(FailureClass::ClientRejected)
            );
        }
    }

    #[test]
    fn test_server_errors_back_off_then_give_up() {
        let policy = policy();
        let mut state = RetryState::default();

        state.attempts = 1;
        assert_eq!(
            policy.decide(&AttemptResult::Status(502), &mut state),
            RetryDecision::Retry {
                delay: Duration::from_millis(100),
                scope: RetryScope::Backoff
            }
        );

        state.attempts = 2;
        assert_eq!(
            policy.decide(&AttemptResult::TransportFailure, &mut state),
            RetryDecision::Retry {
                delay: Duration::from_millis(200),
                scope: RetryScope::Backoff
            }
        );

        state.attempts = 3;
        assert_eq!(
            policy.decide(&AttemptResult::TimedOut, &mut state),
            RetryDecision::GiveUp(FailureClass::TransientServer)
        );
    }

    #[test]
    fn test_rate_limits_do_not_consume_transient_budget() {
        let policy = policy();
        let mut state = RetryState::default();

        for _ in 0..10 {
            let decision = policy.decide(
                &AttemptResult::RateLimited {
                    retry_after: Duration::from_secs(1),
                    global: false,
                },
                &mut state,
            );
            assert_eq!(
                decision,
                RetryDecision::Retry {
                    delay: Duration::from_secs(1),
                    scope: RetryScope::Bucket
                }
            );
        }

        assert_eq!(state.transient_failures, 0);
        assert_eq!(state.rate_limited_for, Duration::from_secs(10));
    }

    #[test]
    fn test_global_rate_limit_scope() {
        let mut state = RetryState::default();
        let decision = policy().decide(
            &AttemptResult::RateLimited {
                retry_after: Duration::from_millis(250),
                global: true,
            },
            &mut state,
        );
        assert_eq!(
            decision,
            RetryDecision::Retry {
                delay: Duration::from_millis(250),
                scope: RetryScope::Global
            }
        );
    }

    #[test]
    fn test_rate_limit_wait_is_bounded() {
        let policy = policy().with_max_rate_limit_wait(Duration::from_secs(5));
        let mut state = RetryState::default();
        let limited = AttemptResult::RateLimited {
            retry_after: Duration::from_secs(3),
            global: false,
        };

        assert!(matches!(
            policy.decide(&limited, &mut state),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(
            policy.decide(&limited, &mut state),
            RetryDecision::GiveUp(FailureClass::RateLimited)
        );
    }
}
