//! Bounded retry with linear backoff
//!
//! The policy is pure ([`RetryPolicy::backoff_delay`], [`RetryController::decide`])
//! so it can be tested without timers. [`RetryController::run`] drives an async
//! operation with that policy and can be cancelled between attempts.
//!
//! **Algorithm:**
//! 1. Attempt operation
//! 2. If successful, return result
//! 3. If the error is transient:
//!    a. If attempts remain: log WARN, sleep `attempt * backoff_unit`, retry
//!    b. Otherwise: log ERROR, report exhaustion
//! 4. If the error is terminal: return it immediately (no retry)
//!
//! No delay follows the final attempt.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default number of activation attempts
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default backoff unit (delay after attempt `n` is `n * unit`)
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Errors that know whether another attempt may succeed
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Retry bound and backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_unit: DEFAULT_BACKOFF_UNIT,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_unit: Duration) -> Self {
        Self {
            // At least one attempt always runs
            max_attempts: max_attempts.max(1),
            backoff_unit,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(attempt)
    }

    /// Full list of inter-attempt delays for a run that exhausts the policy
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|n| self.backoff_delay(n)).collect()
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep, then try again
    RetryAfter(Duration),
    /// Transient failure but no attempts left
    Exhausted,
    /// Terminal failure, retrying cannot help
    Abort,
}

/// Final result of a retry run
#[derive(Debug, PartialEq)]
pub enum RetryOutcome<T, E> {
    Succeeded { value: T, attempts: u32 },
    /// Terminal error, returned without further attempts
    Failed { error: E, attempts: u32 },
    /// Every attempt failed transiently
    Exhausted { last_error: E, attempts: u32 },
    /// Cancelled while waiting between attempts
    Cancelled { last_error: E, attempts: u32 },
}

/// Attempt counter for one retry run
#[derive(Debug)]
pub struct RetryController {
    policy: RetryPolicy,
    attempts_made: u32,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts_made: 0,
        }
    }

    /// Record the start of an attempt and return its 1-based number
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts_made += 1;
        self.attempts_made
    }

    /// Decide the next step after the current attempt failed
    pub fn decide(&self, transient: bool) -> RetryDecision {
        if !transient {
            RetryDecision::Abort
        } else if self.attempts_made >= self.policy.max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::RetryAfter(self.policy.backoff_delay(self.attempts_made))
        }
    }

    /// Run `operation` until it succeeds, fails terminally, exhausts the
    /// policy, or `cancel` fires during a backoff wait
    ///
    /// An attempt in flight is never interrupted; cancellation is observed
    /// only between attempts.
    pub async fn run<F, Fut, T, E>(
        &mut self,
        operation_name: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        loop {
            let attempt = self.begin_attempt();

            if attempt > 1 {
                tracing::debug!(operation = operation_name, attempt, "Retrying operation");
            }

            let err = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(
                            operation = operation_name,
                            attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    return RetryOutcome::Succeeded {
                        value,
                        attempts: attempt,
                    };
                }
                Err(err) => err,
            };

            match self.decide(err.is_transient()) {
                RetryDecision::Abort => {
                    tracing::warn!(
                        operation = operation_name,
                        attempt,
                        error = %err,
                        "Operation failed with non-retryable error"
                    );
                    return RetryOutcome::Failed {
                        error: err,
                        attempts: attempt,
                    };
                }
                RetryDecision::Exhausted => {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        error = %err,
                        "Operation failed: retries exhausted"
                    );
                    return RetryOutcome::Exhausted {
                        last_error: err,
                        attempts: attempt,
                    };
                }
                RetryDecision::RetryAfter(delay) => {
                    tracing::warn!(
                        operation = operation_name,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, will retry after backoff"
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            tracing::info!(
                                operation = operation_name,
                                attempt,
                                "Retry loop cancelled between attempts"
                            );
                            return RetryOutcome::Cancelled {
                                last_error: err,
                                attempts: attempt,
                            };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
