//! Fixed-interval retry loop
//!
//! Each attempt classifies its own outcome as a `Step`:
//! - `Ready`   done, return the value
//! - `Pending` not yet, try again after the interval (if the policy allows)
//! - `Abort`   definitive failure, stop now
//!
//! Attempts run one after another on the calling task; the next one starts only
//! after the previous resolved and the interval elapsed. There is no backoff.
//! Cancellation is observed between attempts and while waiting, never in the
//! middle of a request.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// How often and how many times to try
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `None` retries until cancelled.
    pub max_attempts: Option<u32>,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            interval,
        }
    }

    pub fn unbounded(interval: Duration) -> Self {
        Self {
            max_attempts: None,
            interval,
        }
    }

    /// Whether attempt number `attempt` (1-based) may run
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }
}

/// Where a running loop is, handed to each attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// 1-based
    pub attempt: u32,
    pub policy: RetryPolicy,
}

/// Outcome of one attempt
#[derive(Debug)]
pub enum Step<T, E> {
    Ready(T),
    Pending(E),
    Abort(E),
}

#[derive(Debug, Error)]
pub enum PollError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("aborted on attempt {attempt}: {error}")]
    Aborted { attempt: u32, error: E },

    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl<E> PollError<E> {
    /// Attempts that actually ran
    pub fn attempts(&self) -> u32 {
        match self {
            PollError::Exhausted { attempts, .. } => *attempts,
            PollError::Aborted { attempt, .. } => *attempt,
            PollError::Cancelled { attempts } => *attempts,
        }
    }

    /// The last error reported by an attempt, if any ran to completion
    pub fn last_error(&self) -> Option<&E> {
        match self {
            PollError::Exhausted { last, .. } => Some(last),
            PollError::Aborted { error, .. } => Some(error),
            PollError::Cancelled { .. } => None,
        }
    }
}

/// Runs a request under a `RetryPolicy`
#[derive(Debug, Clone)]
pub struct PollingClient {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl PollingClient {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_cancellation(policy, CancellationToken::new())
    }

    pub fn with_cancellation(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Token that stops the loop at the next attempt boundary
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn execute<F, Fut, T, E>(&self, mut request: F) -> Result<T, PollError<E>>
    where
        F: FnMut(RetryState) -> Fut,
        Fut: Future<Output = Step<T, E>>,
        E: fmt::Display,
    {
        let mut attempt = 1;

        loop {
            if self.cancel.is_cancelled() {
                return Err(PollError::Cancelled {
                    attempts: attempt - 1,
                });
            }

            let state = RetryState {
                attempt,
                policy: self.policy,
            };

            match request(state).await {
                Step::Ready(value) => return Ok(value),
                Step::Abort(error) => {
                    tracing::debug!("Attempt {} aborted: {}", attempt, error);
                    return Err(PollError::Aborted { attempt, error });
                }
                Step::Pending(error) => {
                    if !self.policy.allows(attempt + 1) {
                        tracing::debug!("Attempt {} failed, no attempts left: {}", attempt, error);
                        return Err(PollError::Exhausted {
                            attempts: attempt,
                            last: error,
                        });
                    }

                    tracing::debug!(
                        "Attempt {} failed: {}, retrying in {:?}",
                        attempt,
                        error,
                        self.policy.interval
                    );

                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return Err(PollError::Cancelled { attempts: attempt });
                        }
                        _ = tokio::time::sleep(self.policy.interval) => {}
                    }

                    attempt += 1;
                }
            }
        }
    }
}
