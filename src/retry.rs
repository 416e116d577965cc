//! Bounded retry with exponential backoff
//!
//! [`RetryPolicy`] is a plain value: it knows how many attempts are allowed
//! and how long to wait between them. Call sites apply it explicitly, either
//! through [`RetryPolicy::retry`] or by driving [`RetryPolicy::decide`]
//! themselves when they need to reset the budget mid-flight.

use crate::error::sanitize_error_message;
use crate::shutdown::ShutdownSignal;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Exponential backoff policy: delay after the n-th failure is
/// `base * 2^(n-1)`, clamped to `[min_delay, max_delay]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::connect()
    }
}

impl RetryPolicy {
    /// Policy for establishing the broker connection: 5 attempts, 1s doubling to 10s
    pub fn connect() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Policy for re-establishing a broken subscription: 3 attempts, same backoff
    pub fn subscribe() -> Self {
        Self {
            max_attempts: 3,
            ..Self::connect()
        }
    }

    /// Delay to wait after `attempt` (1-based) failed
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .saturating_mul(factor)
            .max(self.min_delay)
            .min(self.max_delay)
    }

    /// Every delay the policy will ever sleep, in order
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.max_attempts).map(move |attempt| self.delay_after(attempt))
    }

    /// Worst-case time spent sleeping before giving up
    pub fn total_backoff(&self) -> Duration {
        self.delays().sum()
    }

    /// Decide what to do after `failed_attempts` attempts have failed
    pub fn decide(&self, failed_attempts: u32, shutdown_requested: bool) -> RetryDecision {
        if shutdown_requested {
            return RetryDecision::AbortShutdownRequested;
        }
        if failed_attempts >= self.max_attempts {
            return RetryDecision::AbortMaxAttemptsExceeded;
        }
        RetryDecision::Proceed {
            attempt: failed_attempts + 1,
            delay: self.delay_after(failed_attempts),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }
        if self.min_delay > self.max_delay {
            return Err(format!(
                "min_delay ({:?}) must not exceed max_delay ({:?})",
                self.min_delay, self.max_delay
            ));
        }
        Ok(())
    }

    /// Run `operation` until it succeeds, the error is not retryable, the
    /// attempts run out, or shutdown is requested during a backoff sleep.
    ///
    /// `f` receives the 1-based attempt number.
    pub async fn retry<T, E, F, Fut, R>(
        &self,
        operation: &str,
        shutdown: &ShutdownSignal,
        mut is_retryable: R,
        mut f: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut(&E) -> bool,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            let error = match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !is_retryable(&error) {
                return Err(RetryError::Aborted(error));
            }

            match self.decide(attempt, shutdown.is_cancelled()) {
                RetryDecision::Proceed {
                    attempt: next,
                    delay,
                } => {
                    warn!(
                        "{} failed (attempt {}/{}): {}",
                        operation,
                        attempt,
                        self.max_attempts,
                        sanitize_error_message(&error.to_string())
                    );
                    info!(
                        "Retrying {}, attempt {}/{} in {:?}",
                        operation, next, self.max_attempts, delay
                    );
                    if !shutdown.sleep(delay).await {
                        return Err(RetryError::Cancelled {
                            attempts: attempt,
                            last: error,
                        });
                    }
                    attempt = next;
                }
                RetryDecision::AbortShutdownRequested => {
                    return Err(RetryError::Cancelled {
                        attempts: attempt,
                        last: error,
                    });
                }
                RetryDecision::AbortMaxAttemptsExceeded => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: error,
                    });
                }
            }
        }
    }
}

/// Outcome of [`RetryPolicy::decide`]
#[derive(Debug, PartialEq)]
pub enum RetryDecision {
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Why [`RetryPolicy::retry`] gave up
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed
    Exhausted { attempts: u32, last: E },
    /// Shutdown was requested while waiting to retry
    Cancelled { attempts: u32, last: E },
    /// The error was not worth retrying
    Aborted(E),
}

impl<E> RetryError<E> {
    pub fn into_last(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::Cancelled { last, .. } => last,
            RetryError::Aborted(last) => last,
        }
    }
}
